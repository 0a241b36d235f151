//! Build options requested by clients and the server-side engine policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::ValidationError;

/// TeX engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Engine {
    #[default]
    #[serde(rename = "pdf")]
    PdfLatex,
    #[serde(rename = "lua")]
    LuaLatex,
    #[serde(rename = "xe")]
    XeLatex,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::PdfLatex => "pdf",
            Engine::LuaLatex => "lua",
            Engine::XeLatex => "xe",
        }
    }

    /// latexmk flag selecting this engine.
    pub fn driver_flag(&self) -> &'static str {
        match self {
            Engine::PdfLatex => "-pdf",
            Engine::LuaLatex => "-pdflua",
            Engine::XeLatex => "-pdfxe",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = ValidationError;

    /// The empty string selects the default engine.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "pdf" => Ok(Engine::PdfLatex),
            "lua" => Ok(Engine::LuaLatex),
            "xe" => Ok(Engine::XeLatex),
            other => Err(ValidationError::UnknownEngine(other.to_string())),
        }
    }
}

/// Options for one build, snapshotted into the build record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    pub engine: Engine,
    /// Keep going past errors (`-f -interaction=nonstopmode`)
    pub force: bool,
    pub file_line_error: bool,
    /// Main document; latexmk picks one when unset
    pub document: Option<String>,
    /// Emit a dependency list (`-deps`)
    pub dependents: bool,
    /// Empty aux and out before building
    pub clean_build: bool,
}

impl BuildOptions {
    /// Parse query-style pairs: boolean flags by presence, `engine` and
    /// `document` by value. Unknown keys are ignored.
    pub fn from_flags<'a, I>(pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = BuildOptions::default();
        for (key, value) in pairs {
            match key {
                "engine" => options.engine = value.parse()?,
                "document" if !value.is_empty() => options.document = Some(value.to_string()),
                "force" => options.force = true,
                "fileLineError" => options.file_line_error = true,
                "dependents" => options.dependents = true,
                "cleanBuild" => options.clean_build = true,
                _ => {}
            }
        }
        Ok(options)
    }

    /// Inverse of [`BuildOptions::from_flags`].
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("engine", self.engine.as_str().to_string())];
        if let Some(document) = &self.document {
            pairs.push(("document", document.clone()));
        }
        for (flag, set) in [
            ("force", self.force),
            ("fileLineError", self.file_line_error),
            ("dependents", self.dependents),
            ("cleanBuild", self.clean_build),
        ] {
            if set {
                pairs.push((flag, "true".to_string()));
            }
        }
        pairs
    }

    /// JSON snapshot stored with the build record.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Server-side build policy. Never taken from the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildPolicy {
    /// Let latexmk read rc files (otherwise `-norc`)
    pub allow_ambient_config: bool,
    pub allow_lua_engine: bool,
}

impl BuildPolicy {
    /// The engine that will actually run. A disallowed engine falls back to
    /// pdflatex.
    pub fn resolve_engine(&self, requested: Engine) -> Engine {
        match requested {
            Engine::LuaLatex if !self.allow_lua_engine => {
                warn!(
                    requested = %requested,
                    substituted = %Engine::PdfLatex,
                    "engine not allowed by policy, downgrading"
                );
                Engine::PdfLatex
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_parse() {
        assert_eq!("".parse::<Engine>().unwrap(), Engine::PdfLatex);
        assert_eq!("lua".parse::<Engine>().unwrap(), Engine::LuaLatex);
        assert_eq!("xe".parse::<Engine>().unwrap(), Engine::XeLatex);
        assert_eq!(
            "context".parse::<Engine>().unwrap_err(),
            ValidationError::UnknownEngine("context".into())
        );
    }

    #[test]
    fn flags_by_presence() {
        let opts = BuildOptions::from_flags([
            ("force", ""),
            ("engine", "xe"),
            ("document", "thesis.tex"),
            ("cleanBuild", "0"),
            ("utm_source", "x"),
        ])
        .unwrap();
        assert!(opts.force);
        assert!(opts.clean_build);
        assert!(!opts.dependents);
        assert_eq!(opts.engine, Engine::XeLatex);
        assert_eq!(opts.document.as_deref(), Some("thesis.tex"));

        let back: Vec<(&str, String)> = opts.to_query_pairs();
        let reparsed =
            BuildOptions::from_flags(back.iter().map(|(k, v)| (*k, v.as_str()))).unwrap();
        assert_eq!(reparsed, opts);
    }

    #[test]
    fn snapshot_is_camel_case() {
        let opts = BuildOptions {
            file_line_error: true,
            ..Default::default()
        };
        let json = opts.snapshot();
        assert_eq!(json["fileLineError"], true);
        assert_eq!(json["engine"], "pdf");
    }

    #[test]
    fn lua_downgraded_unless_allowed() {
        let strict = BuildPolicy::default();
        assert_eq!(strict.resolve_engine(Engine::LuaLatex), Engine::PdfLatex);
        assert_eq!(strict.resolve_engine(Engine::XeLatex), Engine::XeLatex);

        let open = BuildPolicy {
            allow_lua_engine: true,
            ..Default::default()
        };
        assert_eq!(open.resolve_engine(Engine::LuaLatex), Engine::LuaLatex);
    }
}
