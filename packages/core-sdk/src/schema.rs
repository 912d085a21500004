use once_cell::sync::Lazy;
use serde_json::{json, Value};

static FRAGMENT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "commentary": {
                "type": "string",
                "description": "Describe what you're about to do and the steps you want to take for generating the fragment in great detail."
            },
            "template": {
                "type": "string",
                "description": "Name of the template used to generate the fragment."
            },
            "title": {
                "type": "string",
                "description": "Short title of the fragment. Max 3 words."
            },
            "description": {
                "type": "string",
                "description": "Short description of the fragment. Max 1 sentence."
            },
            "additional_dependencies": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Additional dependencies required by the fragment."
            },
            "has_additional_dependencies": {
                "type": "boolean",
                "description": "Detect if additional dependencies are required."
            },
            "install_dependencies_command": {
                "type": "string",
                "description": "Command to install additional dependencies."
            },
            "port": {
                "type": ["integer", "null"],
                "description": "Port number used by the resulted fragment."
            },
            "file_path": {
                "type": "string",
                "description": "Relative path to the file, including the file name."
            },
            "code": {
                "type": "string",
                "description": "Code generated by the fragment. Only runnable code is allowed."
            }
        },
        "required": [
            "commentary", "template", "title", "description", "additional_dependencies",
            "has_additional_dependencies", "install_dependencies_command", "port",
            "file_path", "code"
        ]
    })
});

static EDIT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "commentary": {
                "type": "string",
                "description": "Explain what changes you are making and why"
            },
            "instruction": {
                "type": "string",
                "description": "One line instruction on what the change is"
            },
            "edit": {
                "type": "string",
                "description": "The code changes with // ... existing code ... for unchanged parts"
            },
            "file_path": {
                "type": "string",
                "description": "Path to the file being edited"
            }
        },
        "required": ["commentary", "instruction", "edit", "file_path"]
    })
});

/**
 * \brief 代码片段的 JSON Schema。
 */
pub fn fragment_schema() -> &'static Value {
    &FRAGMENT_SCHEMA
}

/**
 * \brief Morph 编辑指令的 JSON Schema。
 */
pub fn edit_schema() -> &'static Value {
    &EDIT_SCHEMA
}
