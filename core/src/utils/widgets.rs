//! Named notebook parameters with defaults.
//!
//! A widget declares a parameter and its default value. A binding supplies
//! the value from outside the notebook (a job run or `--param` on the
//! command line) and takes precedence over the default.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::error::{LakebookError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetKind {
    Text,
    Dropdown { choices: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Widget {
    pub name: String,
    pub kind: WidgetKind,
    pub default_value: String,
    pub label: Option<String>,
}

impl Widget {
    fn accepts(&self, value: &str) -> bool {
        match &self.kind {
            WidgetKind::Text => true,
            WidgetKind::Dropdown { choices } => choices.iter().any(|c| c == value),
        }
    }
}

#[derive(Debug, Default)]
struct WidgetState {
    widgets: BTreeMap<String, Widget>,
    bindings: HashMap<String, String>,
}

/// Widget registry of a session.
#[derive(Debug, Default)]
pub struct Widgets {
    state: RwLock<WidgetState>,
}

impl Widgets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a free-text widget. Redefining a widget replaces it.
    pub fn text(&self, name: &str, default_value: &str, label: Option<&str>) -> Result<()> {
        self.define(Widget {
            name: name.to_string(),
            kind: WidgetKind::Text,
            default_value: default_value.to_string(),
            label: label.map(str::to_string),
        })
    }

    /// Declare a widget restricted to `choices`.
    pub fn dropdown(
        &self,
        name: &str,
        default_value: &str,
        choices: &[&str],
        label: Option<&str>,
    ) -> Result<()> {
        let widget = Widget {
            name: name.to_string(),
            kind: WidgetKind::Dropdown {
                choices: choices.iter().map(|c| c.to_string()).collect(),
            },
            default_value: default_value.to_string(),
            label: label.map(str::to_string),
        };
        if !widget.accepts(default_value) {
            return Err(LakebookError::invalid(format!(
                "default value '{default_value}' of widget '{name}' is not one of the choices"
            )));
        }
        self.define(widget)
    }

    fn define(&self, widget: Widget) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(bound) = state.bindings.get(&widget.name) {
            if !widget.accepts(bound) {
                return Err(LakebookError::invalid(format!(
                    "bound value '{bound}' of widget '{}' is not one of the choices",
                    widget.name
                )));
            }
        }
        debug!("Defined widget {}", widget.name);
        state.widgets.insert(widget.name.clone(), widget);
        Ok(())
    }

    /// Supply a value from outside the notebook.
    pub fn bind(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(widget) = state.widgets.get(name) {
            if !widget.accepts(value) {
                return Err(LakebookError::invalid(format!(
                    "value '{value}' is not one of the choices of widget '{name}'"
                )));
            }
        }
        state.bindings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Current value: the binding if present, else the widget default.
    pub fn get(&self, name: &str) -> Result<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = state.bindings.get(name) {
            return Ok(value.clone());
        }
        state
            .widgets
            .get(name)
            .map(|w| w.default_value.clone())
            .ok_or_else(|| LakebookError::WidgetNotDefined(name.to_string()))
    }

    /// Values of every defined or bound widget.
    pub fn get_all(&self) -> BTreeMap<String, String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut values: BTreeMap<String, String> = state
            .widgets
            .values()
            .map(|w| (w.name.clone(), w.default_value.clone()))
            .collect();
        for (name, value) in &state.bindings {
            values.insert(name.clone(), value.clone());
        }
        values
    }

    pub fn widget(&self, name: &str) -> Option<Widget> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .widgets
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .widgets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| LakebookError::WidgetNotDefined(name.to_string()))
    }

    /// Remove every widget. Bindings stay in place.
    pub fn remove_all(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .widgets
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_widget_default_and_binding() {
        let widgets = Widgets::new();
        widgets.text("param1", "default_value", Some("Parameter 1")).unwrap();
        assert_eq!(widgets.get("param1").unwrap(), "default_value");

        widgets.bind("param1", "from_job").unwrap();
        assert_eq!(widgets.get("param1").unwrap(), "from_job");
        assert_eq!(widgets.get_all().get("param1").map(String::as_str), Some("from_job"));
    }

    #[test]
    fn test_undefined_widget() {
        let widgets = Widgets::new();
        assert!(matches!(
            widgets.get("missing"),
            Err(LakebookError::WidgetNotDefined(_))
        ));
        assert!(widgets.remove("missing").is_err());
    }

    #[test]
    fn test_dropdown_choices() {
        let widgets = Widgets::new();
        assert!(widgets.dropdown("env", "qa", &["dev", "prod"], None).is_err());
        widgets.dropdown("env", "dev", &["dev", "prod"], None).unwrap();
        assert!(widgets.bind("env", "staging").is_err());
        widgets.bind("env", "prod").unwrap();
        assert_eq!(widgets.get("env").unwrap(), "prod");

        widgets.remove_all();
        assert!(widgets.widget("env").is_none());
        // the binding outlives the widget
        assert_eq!(widgets.get("env").unwrap(), "prod");
    }
}
