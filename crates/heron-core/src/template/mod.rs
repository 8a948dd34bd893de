//! Static prompt template catalog.
//!
//! Templates are defined in `templates.toml` and embedded in the binary at
//! compile time. The catalog is immutable; creating a task from a template
//! renders the prompt by substituting `{{input}}`.

use serde::{Deserialize, Serialize};

/// A single prompt template from the embedded catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    /// Stable identifier used by the create-from-template operation.
    pub id: String,
    /// Human-readable name; also seeds the derived task name.
    pub name: String,
    /// What the template is for.
    pub description: String,
    /// Prompt body containing the `{{input}}` placeholder.
    pub prompt: String,
}

impl TaskTemplate {
    /// Render the prompt with the caller's input substituted for
    /// `{{input}}`. The input is trimmed first.
    pub fn render_prompt(&self, input_text: &str) -> String {
        self.prompt.replace("{{input}}", input_text.trim())
    }

    /// Default task name when the caller supplies none.
    pub fn derived_task_name(&self) -> String {
        format!("{} Task", self.name)
    }
}

/// Container for deserializing the embedded TOML file.
#[derive(Debug, Deserialize)]
struct TemplateCatalog {
    templates: Vec<TaskTemplate>,
}

/// The embedded template catalog TOML.
static TEMPLATES_TOML: &str = include_str!("templates.toml");

/// The static, immutable template registry.
pub struct TemplateRegistry {
    templates: Vec<TaskTemplate>,
}

impl TemplateRegistry {
    /// Load the embedded catalog.
    ///
    /// # Panics
    ///
    /// Panics if the embedded TOML is malformed. This is a compile-time
    /// invariant -- if the binary was built, the TOML is valid.
    pub fn builtin() -> Self {
        let catalog: TemplateCatalog =
            toml::from_str(TEMPLATES_TOML).expect("embedded templates.toml is invalid");
        Self {
            templates: catalog.templates,
        }
    }

    /// Look up a template by id. Surrounding whitespace in the id is
    /// ignored.
    pub fn get(&self, template_id: &str) -> Option<&TaskTemplate> {
        let normalized = template_id.trim();
        self.templates.iter().find(|t| t.id == normalized)
    }

    /// All templates, in catalog order.
    pub fn list(&self) -> &[TaskTemplate] {
        &self.templates
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
