//! Translation of build options into latexmk arguments.

use std::path::PathBuf;

use remotex_core::{validate_relative_path, BuildOptions, BuildPolicy, ValidationError};

/// Host directories a build reads and writes.
#[derive(Debug, Clone)]
pub struct DriverDirs {
    /// Sources; the driver's working directory
    pub src: PathBuf,
    /// Durable intermediates. `None` means scratch space only.
    pub aux: Option<PathBuf>,
    pub out: PathBuf,
    /// Shared read-only includes
    pub shared: Option<PathBuf>,
}

/// Everything an executor needs for one build.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub options: BuildOptions,
    pub dirs: DriverDirs,
    pub policy: BuildPolicy,
}

/// Documents are project-relative and must not read as a flag.
pub fn validate_document(document: &str) -> Result<(), ValidationError> {
    if document.starts_with('-') {
        return Err(ValidationError::InvalidDocument {
            document: document.to_string(),
            reason: "starts with '-'",
        });
    }
    validate_relative_path(document).map_err(|_| ValidationError::InvalidDocument {
        document: document.to_string(),
        reason: "not a path inside the project sources",
    })
}

/// latexmk arguments for `options`, with aux/out given as the paths the
/// driver will see.
pub fn driver_args(
    options: &BuildOptions,
    aux_dir: Option<&str>,
    out_dir: &str,
    policy: &BuildPolicy,
) -> Result<Vec<String>, ValidationError> {
    let engine = policy.resolve_engine(options.engine);
    let mut args = vec![engine.driver_flag().to_string()];

    if let Some(aux) = aux_dir {
        args.push(format!("-auxdir={aux}"));
    }
    args.push(format!("-outdir={out_dir}"));

    if !policy.allow_ambient_config {
        args.push("-norc".to_string());
    }

    if options.force {
        args.push("-f".to_string());
        args.push("-interaction=nonstopmode".to_string());
    } else {
        args.push("-interaction=batchmode".to_string());
    }

    if options.file_line_error {
        args.push("-file-line-error".to_string());
    }
    if options.dependents {
        args.push("-deps".to_string());
    }

    if let Some(document) = &options.document {
        validate_document(document)?;
        args.push(document.clone());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use remotex_core::Engine;

    #[test]
    fn default_options() {
        let args = driver_args(
            &BuildOptions::default(),
            Some("/p/aux"),
            "/p/out",
            &BuildPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            args,
            vec![
                "-pdf",
                "-auxdir=/p/aux",
                "-outdir=/p/out",
                "-norc",
                "-interaction=batchmode"
            ]
        );
    }

    #[test]
    fn every_flag_in_order() {
        let options = BuildOptions {
            engine: Engine::XeLatex,
            force: true,
            file_line_error: true,
            document: Some("thesis.tex".into()),
            dependents: true,
            clean_build: true,
        };
        let policy = BuildPolicy {
            allow_ambient_config: true,
            allow_lua_engine: false,
        };
        let args = driver_args(&options, None, "/mnt/out", &policy).unwrap();
        assert_eq!(
            args,
            vec![
                "-pdfxe",
                "-outdir=/mnt/out",
                "-f",
                "-interaction=nonstopmode",
                "-file-line-error",
                "-deps",
                "thesis.tex"
            ]
        );
    }

    #[test]
    fn lua_downgraded_by_policy() {
        let options = BuildOptions {
            engine: Engine::LuaLatex,
            ..Default::default()
        };
        let strict = driver_args(&options, None, "o", &BuildPolicy::default()).unwrap();
        assert_eq!(strict[0], "-pdf");

        let open = BuildPolicy {
            allow_lua_engine: true,
            ..Default::default()
        };
        assert_eq!(driver_args(&options, None, "o", &open).unwrap()[0], "-pdflua");
    }

    #[test]
    fn documents_that_look_like_flags_are_rejected() {
        for document in ["-shell-escape", "../../etc/passwd", "/abs.tex"] {
            let options = BuildOptions {
                document: Some(document.into()),
                ..Default::default()
            };
            assert!(
                driver_args(&options, None, "o", &BuildPolicy::default()).is_err(),
                "{document}"
            );
        }
    }
}
