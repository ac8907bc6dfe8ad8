//! Composition of the unified test-document grammar.
//!
//! The grammar has a fixed skeleton; every registered command contributes a
//! discriminated `anyOf` branch to the task definition and every module with
//! a defaults schema contributes a property to the defaults definition.

use serde_json::{json, Map, Value};

use crate::module::ModuleRegistry;

pub(crate) fn format_schema_error(error: &jsonschema::ValidationError) -> String {
    let path = error.instance_path.to_string();
    if path.is_empty() {
        error.to_string()
    } else {
        format!("{}: {}", path, error)
    }
}

pub fn compose_document_schema(registry: &ModuleRegistry) -> Value {
    let mut task_branches = Vec::new();
    let mut defaults_properties = Map::new();
    for module in registry.all_modules() {
        if let Some(schema) = &module.defaults_schema {
            defaults_properties.insert(module.name.clone(), schema.clone());
        }
        for command in module.commands.values() {
            let mut properties = Map::new();
            properties.insert("do".to_owned(), json!({"enum": [command.id]}));
            if let Some(args) = &command.args_schema {
                properties.insert("args".to_owned(), args.clone());
            }
            if let Some(expect) = &command.expect_schema {
                properties.insert("expect".to_owned(), expect.clone());
            }
            task_branches.push(json!({
                "description": command.handler.description(),
                "properties": properties,
            }));
        }
    }
    if task_branches.is_empty() {
        // An empty registry still yields a usable grammar.
        task_branches.push(json!({}));
    }

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Dexit test document",
        "definitions": {
            "task": {
                "type": "object",
                "required": ["do"],
                "additionalProperties": false,
                "properties": {
                    "id": {"type": "string"},
                    "description": {"type": "string"},
                    "do": {"type": "string"},
                    "args": {"type": "object", "default": {}},
                    "expect": {"type": "object"},
                    "set": {"type": "object", "additionalProperties": {"type": "string"}},
                    "runBeforeAsync": {"type": "string"},
                    "continueOnError": {"type": "boolean", "default": false},
                },
                "anyOf": task_branches,
            },
            "taskList": {
                "type": "array",
                "items": {"$ref": "#/definitions/task"},
            },
            "test": {
                "type": "object",
                "required": ["description", "tasks"],
                "additionalProperties": false,
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "defaults": {"$ref": "#/definitions/defaults"},
                    "params": {"type": "object"},
                    "skip": {"type": "boolean", "default": false},
                    "tasks": {"$ref": "#/definitions/taskList"},
                },
            },
            "defaults": {
                "type": "object",
                "properties": defaults_properties,
                "patternProperties": {".*": {"type": "object"}},
            },
        },
        "type": "object",
        "required": ["name"],
        "additionalProperties": false,
        "properties": {
            "name": {"type": "string", "pattern": "^[A-Za-z0-9_-]+(\\.[A-Za-z0-9_-]+)*$"},
            "description": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "defaults": {"$ref": "#/definitions/defaults"},
            "params": {"type": "object"},
            "beforeAll": {"$ref": "#/definitions/taskList"},
            "afterAll": {"$ref": "#/definitions/taskList"},
            "beforeEach": {"$ref": "#/definitions/taskList"},
            "afterEach": {"$ref": "#/definitions/taskList"},
            "executionOrder": {"enum": ["async", "sync"], "default": "async"},
            "skip": {"type": "boolean", "default": false},
            "tests": {"type": "array", "items": {"$ref": "#/definitions/test"}},
        },
    })
}

#[cfg(test)]
mod tests {
    use googletest::{assert_that, expect_that, prelude::*};
    use serde_json::json;

    use super::*;
    use crate::modules;

    fn composed_validator() -> jsonschema::Validator {
        let mut registry = ModuleRegistry::new();
        modules::register_builtins(&mut registry).unwrap();
        jsonschema::validator_for(&compose_document_schema(&registry))
            .expect("composed schema should compile")
    }

    #[googletest::test]
    fn test_accepts_a_complete_document() {
        let validator = composed_validator();
        let doc = json!({
            "name": "api.auth",
            "tags": ["auth"],
            "params": {"user": "alice"},
            "beforeAll": [{"do": "vars.echo", "args": {"seeded": true}}],
            "executionOrder": "sync",
            "tests": [{
                "description": "logs in",
                "tasks": [
                    {"id": "login", "do": "exec.run", "args": {"command": "true"}},
                    {"do": "vars.echo", "args": {"token": "${token}"}, "set": {"token": "$.token"}},
                ],
            }],
        });
        assert_that!(validator.iter_errors(&doc).count(), eq(0));
    }

    #[googletest::test]
    fn test_rejects_unknown_commands_via_branches() {
        let validator = composed_validator();
        let doc = json!({
            "name": "x",
            "tests": [{"description": "t", "tasks": [{"do": "nosuch.command"}]}],
        });
        expect_that!(validator.iter_errors(&doc).count(), gt(0));
    }

    #[googletest::test]
    fn test_rejects_unknown_task_fields() {
        let validator = composed_validator();
        let doc = json!({
            "name": "x",
            "tests": [{"description": "t", "tasks": [{"do": "vars.echo", "retries": 3}]}],
        });
        expect_that!(validator.iter_errors(&doc).count(), gt(0));
    }

    #[googletest::test]
    fn test_rejects_command_args_that_violate_the_command_schema() {
        let validator = composed_validator();
        let doc = json!({
            "name": "x",
            "tests": [{"description": "t", "tasks": [{"do": "exec.run", "args": {}}]}],
        });
        expect_that!(validator.iter_errors(&doc).count(), gt(0));
    }

    #[googletest::test]
    fn test_defaults_accept_module_and_generic_shapes() {
        let validator = composed_validator();
        let doc = json!({
            "name": "x",
            "defaults": {"exec": {"command": "true"}, "someOtherModule": {"retries": 2}},
        });
        assert_that!(validator.iter_errors(&doc).count(), eq(0));
    }
}
