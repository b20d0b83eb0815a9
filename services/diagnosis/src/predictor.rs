//! Classification of staged images.
//!
//! The service does not run the model itself. [`ProcessPredictor`] starts the
//! configured classifier program with the absolute image path as its final
//! argument and reads the label from the last non-blank line it prints.

use crate::config::PredictorConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

/// Errors that can occur while classifying an image.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Failed to start classifier: {0}")]
    Spawn(String),

    #[error("Classifier exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Classifier produced no label")]
    EmptyOutput,
}

/// Produces a `plant___disease` label for an image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, image_path: &Path) -> Result<String, PredictError>;
}

/// Runs an external classifier process per request
pub struct ProcessPredictor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl ProcessPredictor {
    pub fn new(config: &PredictorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

#[async_trait]
impl Predictor for ProcessPredictor {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn predict(&self, image_path: &Path) -> Result<String, PredictError> {
        let image_path = tokio::fs::canonicalize(image_path)
            .await
            .map_err(|e| PredictError::Spawn(format!("{}: {}", image_path.display(), e)))?;

        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(&image_path);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        info!(image_path = %image_path.display(), "Running classifier");

        let output = command
            .output()
            .await
            .map_err(|e| PredictError::Spawn(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(status = %output.status, stderr = %stderr, "Classifier failed");
            return Err(PredictError::Failed {
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!(stdout = %stdout, "Classifier output");

        let label = last_label_line(&stdout).ok_or(PredictError::EmptyOutput)?;
        info!(label = %label, "Classifier label");

        Ok(label)
    }
}

/// Last non-blank line of classifier output with terminal escapes removed
pub fn last_label_line(output: &str) -> Option<String> {
    strip_ansi(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_owned)
}

/// Remove ANSI escape sequences and backspaces.
///
/// Handles CSI sequences (`ESC [ params final`), which is what progress bars
/// and colored loggers emit, plus two-byte `ESC x` escapes.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\x1b' => match chars.next() {
                Some('[') => {
                    // Parameters and intermediates run until a final byte in @..=~
                    for next in chars.by_ref() {
                        if ('@'..='~').contains(&next) {
                            break;
                        }
                    }
                }
                Some(_) | None => {}
            },
            '\x08' => {}
            _ => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ansi_colors() {
        assert_eq!(
            strip_ansi("\x1b[32mTomato___Late_blight\x1b[0m"),
            "Tomato___Late_blight"
        );
        assert_eq!(strip_ansi("\x1b[1;31mERR\x1b[m ok"), "ERR ok");
    }

    #[test]
    fn test_strip_ansi_cursor_and_backspace() {
        assert_eq!(strip_ansi("50%\x1b[2K\r100%"), "50%\r100%");
        assert_eq!(strip_ansi("ab\x08c"), "abc");
        assert_eq!(strip_ansi("plain text"), "plain text");
    }

    #[test]
    fn test_last_label_line_skips_trailing_blanks() {
        let output = "Loading model...\n1/1 [==============================] - 0s\n\x1b[32mApple___Black_rot\x1b[0m\n\n  \n";
        assert_eq!(last_label_line(output), Some("Apple___Black_rot".to_string()));
    }

    #[test]
    fn test_last_label_line_handles_crlf() {
        assert_eq!(
            last_label_line("warmup\r\nPotato___healthy\r\n"),
            Some("Potato___healthy".to_string())
        );
    }

    #[test]
    fn test_last_label_line_empty_output() {
        assert_eq!(last_label_line(""), None);
        assert_eq!(last_label_line("\n \n\x1b[0m\n"), None);
    }

    #[cfg(unix)]
    fn shell_predictor(script: &str) -> ProcessPredictor {
        ProcessPredictor::new(&PredictorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "classifier".to_string()],
            working_dir: None,
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_predictor_reads_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("leaf.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let predictor = shell_predictor(
            r#"test -f "$1" || exit 9; printf 'loading\n\033[32mTomato___Blight\033[0m\n\n'"#,
        );

        let label = predictor.predict(&image).await.unwrap();
        assert_eq!(label, "Tomato___Blight");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_predictor_passes_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("leaf.png");
        std::fs::write(&image, b"png").unwrap();

        let predictor = shell_predictor(r#"echo "$1""#);

        let label = predictor.predict(&image).await.unwrap();
        assert!(Path::new(&label).is_absolute());
        assert!(label.ends_with("leaf.png"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_predictor_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("leaf.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let predictor = shell_predictor("echo 'model missing' >&2; exit 3");

        match predictor.predict(&image).await.unwrap_err() {
            PredictError::Failed { stderr, .. } => assert_eq!(stderr, "model missing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_predictor_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("leaf.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let predictor = shell_predictor("printf '\\n\\n'");

        assert!(matches!(
            predictor.predict(&image).await.unwrap_err(),
            PredictError::EmptyOutput
        ));
    }

    #[tokio::test]
    async fn test_process_predictor_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("leaf.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let predictor = ProcessPredictor::new(&PredictorConfig {
            program: "plantlens-no-such-classifier".to_string(),
            args: Vec::new(),
            working_dir: None,
        });

        assert!(matches!(
            predictor.predict(&image).await.unwrap_err(),
            PredictError::Spawn(_)
        ));
    }
}
