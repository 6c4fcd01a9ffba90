//! # Prompt templates
//!
//! The analyst talks to the model through five named prompts:
//!
//! | Name                 | Slots                                                        |
//! |----------------------|--------------------------------------------------------------|
//! | `db_analyst`         | `db_context`, `user_question`                                |
//! | `sql_corrector`      | `user_question`, `db_context`, `faulty_sql`, `error_message` |
//! | `final_analyst`      | `user_question`, `data_frame`                                |
//! | `follow_up`          | `db_context`, `conversation_history`, `follow_up_question`   |
//! | `retention_analysis` | `data_frame`                                                 |
//!
//! Each prompt is a small YAML document stored at `<prompts_dir>/<name>.yaml`:
//!
//! ```yaml
//! description: "Turns a question into one SQL statement"
//! template: |
//!   You are a senior data analyst.
//!   {db_context}
//!   Question: {user_question}
//! ```
//!
//! `{slot}` is replaced by the named value, `{{` and `}}` produce literal braces.
//! Rendering fails when a slot in the template has no value.
//!
//! The crate ships defaults for all of them ([`PromptSet::bundled`]); `analyst
//! init` writes them into the config directory so they can be edited.

use std::{collections::HashMap, fs, path::Path};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{AnalystError, Result};

pub const DB_ANALYST: &str = "db_analyst";
pub const SQL_CORRECTOR: &str = "sql_corrector";
pub const FINAL_ANALYST: &str = "final_analyst";
pub const FOLLOW_UP: &str = "follow_up";
pub const RETENTION_ANALYSIS: &str = "retention_analysis";

/// Names of every bundled prompt.
pub const PROMPT_NAMES: [&str; 5] = [
    DB_ANALYST,
    SQL_CORRECTOR,
    FINAL_ANALYST,
    FOLLOW_UP,
    RETENTION_ANALYSIS,
];

static BUNDLED: [(&str, &str); 5] = [
    (DB_ANALYST, include_str!("../templates/db_analyst.yaml")),
    (SQL_CORRECTOR, include_str!("../templates/sql_corrector.yaml")),
    (FINAL_ANALYST, include_str!("../templates/final_analyst.yaml")),
    (FOLLOW_UP, include_str!("../templates/follow_up.yaml")),
    (RETENTION_ANALYSIS, include_str!("../templates/retention_analysis.yaml")),
];

static SLOT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("slot pattern is valid")
});

/// One prompt: free text with named `{slot}` placeholders.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PromptTemplate {
    #[serde(skip)]
    pub name: String,

    /// Human-readable note on what the prompt is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Prompt text with `{slot}` placeholders.
    pub template: String,
}

impl PromptTemplate {
    pub fn new(name: &str, template: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            template: template.into(),
        }
    }

    /// Parse a YAML prompt document.
    pub fn from_yaml(name: &str, yaml: &str) -> Result<Self> {
        let mut prompt: PromptTemplate = serde_yaml::from_str(yaml)?;
        prompt.name = name.to_string();
        Ok(prompt)
    }

    /// Substitute `vars` into the template.
    ///
    /// ### Errors
    /// [`AnalystError::Template`] naming the first slot without a value.
    pub fn render(&self, vars: &[(&str, &str)]) -> Result<String> {
        let values: HashMap<&str, &str> = vars.iter().copied().collect();

        if let Some(missing) = SLOT
            .captures_iter(&self.template)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str())
            .find(|slot| !values.contains_key(slot))
        {
            return Err(AnalystError::template(
                &self.name,
                format!("no value for slot `{missing}`"),
            ));
        }

        let rendered = SLOT.replace_all(&self.template, |cap: &Captures| match cap.get(1) {
            Some(slot) => values.get(slot.as_str()).copied().unwrap_or_default().to_string(),
            None => cap[0][..1].to_string(),
        });
        Ok(rendered.into_owned())
    }
}

/// The four prompts used by the analysis pipeline.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub db_analyst: PromptTemplate,
    pub sql_corrector: PromptTemplate,
    pub final_analyst: PromptTemplate,
    pub follow_up: PromptTemplate,
}

impl PromptSet {
    /// The defaults compiled into the binary.
    pub fn bundled() -> Result<Self> {
        Self::from_lookup(bundled_template)
    }

    /// Load every prompt from `<dir>/<name>.yaml`.
    ///
    /// ### Errors
    /// Fails if any prompt is missing or is not valid YAML.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        Self::from_lookup(|name| load_template(dir, name))
    }

    fn from_lookup(mut lookup: impl FnMut(&str) -> Result<PromptTemplate>) -> Result<Self> {
        Ok(Self {
            db_analyst: lookup(DB_ANALYST)?,
            sql_corrector: lookup(SQL_CORRECTOR)?,
            final_analyst: lookup(FINAL_ANALYST)?,
            follow_up: lookup(FOLLOW_UP)?,
        })
    }
}

/// The default of prompt `name` compiled into the binary.
pub fn bundled_template(name: &str) -> Result<PromptTemplate> {
    let yaml = BUNDLED
        .iter()
        .find(|(bundled, _)| *bundled == name)
        .map(|(_, yaml)| *yaml)
        .ok_or_else(|| AnalystError::template(name, "not bundled"))?;
    PromptTemplate::from_yaml(name, yaml)
}

/// `<dir>/<name>.yaml` when that file exists, otherwise the bundled default.
pub fn load_or_bundled(dir: &Path, name: &str) -> Result<PromptTemplate> {
    if dir.join(format!("{name}.yaml")).is_file() {
        load_template(dir, name)
    } else {
        bundled_template(name)
    }
}

/// Load a single prompt from `<dir>/<name>.yaml`.
pub fn load_template(dir: &Path, name: &str) -> Result<PromptTemplate> {
    let path = dir.join(format!("{name}.yaml"));
    tracing::info!("Loading prompt: {}", path.display());

    let content = fs::read_to_string(&path)
        .map_err(|err| AnalystError::template(name, format!("{}: {err}", path.display())))?;
    PromptTemplate::from_yaml(name, &content)
}

/// Write the bundled prompts into `dir`, keeping files that already exist.
///
/// Returns the paths that were written.
pub fn write_bundled(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for (name, yaml) in BUNDLED.iter() {
        let path = dir.join(format!("{name}.yaml"));
        if path.exists() {
            continue;
        }
        fs::write(&path, yaml)?;
        written.push(path);
    }
    Ok(written)
}
