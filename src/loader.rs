//! Loading of test documents from disk. Each YAML file is a stream of one
//! or more documents; every document becomes its own [`TestDocument`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize as _;
use serde_json::Value;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct TestDocument {
    pub filename: String,
    pub path: PathBuf,
    pub content: Value,
}

pub fn load_documents(tests_path: &Path) -> anyhow::Result<Vec<TestDocument>> {
    if !tests_path.is_dir() {
        bail!("tests directory {:?} does not exist", tests_path);
    }
    let mut documents = Vec::new();
    for entry in WalkDir::new(tests_path).sort_by_file_name() {
        let entry = entry.context("walking tests directory")?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.path().extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {}
            _ => continue,
        }
        let raw = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        documents.extend(parse_documents(entry.path(), &raw)?);
    }
    debug!("loaded {} test document(s) from {:?}", documents.len(), tests_path);
    Ok(documents)
}

/// Parse one YAML stream into documents. Empty documents are dropped.
pub fn parse_documents(path: &Path, raw: &str) -> anyhow::Result<Vec<TestDocument>> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(raw) {
        let yaml = serde_yaml::Value::deserialize(deserializer)
            .with_context(|| format!("parsing YAML in {}", path.display()))?;
        if yaml.is_null() {
            continue;
        }
        let content = serde_json::to_value(&yaml)
            .with_context(|| format!("converting {} to JSON values", path.display()))?;
        documents.push(TestDocument {
            filename: filename.clone(),
            path: path.to_path_buf(),
            content,
        });
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use googletest::{assert_that, expect_that, prelude::*};
    use indoc::indoc;

    use super::*;

    #[googletest::test]
    fn test_loads_multi_document_streams_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.yaml"),
            indoc! {"
                name: beta
            "},
        )
        .unwrap();
        fs::write(
            dir.path().join("a.yaml"),
            indoc! {"
                name: alpha.one
                ---
                name: alpha.two
            "},
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let docs = load_documents(dir.path()).unwrap();
        let names: Vec<&str> = docs
            .iter()
            .map(|d| d.content["name"].as_str().unwrap())
            .collect();
        assert_that!(names, eq(&vec!["alpha.one", "alpha.two", "beta"]));
        expect_that!(docs[0].filename, eq("a.yaml"));
    }

    #[googletest::test]
    fn test_walks_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("api")).unwrap();
        fs::write(dir.path().join("api").join("auth.yml"), "name: api.auth\n").unwrap();
        let docs = load_documents(dir.path()).unwrap();
        assert_that!(docs, len(eq(1)));
        expect_that!(docs[0].content["name"].as_str().unwrap(), eq("api.auth"));
    }

    #[googletest::test]
    fn test_missing_directory_is_fatal() {
        expect_that!(
            load_documents(Path::new("/nonexistent/tests")),
            err(anything())
        );
    }

    #[googletest::test]
    fn test_empty_documents_are_dropped() {
        let docs = parse_documents(Path::new("x.yaml"), "---\n---\nname: real\n").unwrap();
        assert_that!(docs, len(eq(1)));
    }
}
