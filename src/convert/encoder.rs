use super::Encoder;
use crate::error::ConversionError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs one conversion: either a plain copy or an ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct ConversionExecutor {
    program: String,
    error_dir: PathBuf,
}

impl ConversionExecutor {
    pub fn new(program: impl Into<String>, error_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            error_dir: error_dir.into(),
        }
    }

    pub fn error_dir(&self) -> &Path {
        &self.error_dir
    }

    /// Convert `source` into `target` with an already normalized parameter string.
    ///
    /// On encoder failure the stderr output is written to
    /// `<error_dir>/<target file name>.log` and any partial target is removed.
    pub async fn exec(
        &self,
        encoder: Encoder,
        source: &Path,
        target: &Path,
        params: &str,
    ) -> Result<(), ConversionError> {
        if encoder == Encoder::Copy {
            tokio::fs::copy(source, target)
                .await
                .map_err(|e| ConversionError::Io {
                    path: target.to_path_buf(),
                    source: e,
                })?;
            return Ok(());
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"]);
        cmd.arg(source);
        cmd.args(["-map_metadata", "0"]);
        cmd.args(encoder.codec_args(params));
        cmd.arg(target);

        // Keep the encoder out of the terminal's process group so Ctrl-C
        // stops the queue without killing conversions that are running.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("Running encoder: {:?}", cmd);

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ConversionError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let _ = tokio::fs::remove_file(target).await;

        let log = self.log_path(target);
        let mut contents = format!(
            "source: {}\ntarget: {}\nparameters: {}\nstatus: {}\n\n",
            source.display(),
            target.display(),
            params,
            output.status
        );
        contents.push_str(&String::from_utf8_lossy(&output.stderr));

        if let Err(e) = self.write_log(&log, &contents).await {
            warn!("Failed to write error log {}: {}", log.display(), e);
        }

        Err(ConversionError::Encoder {
            status: output.status.to_string(),
            log,
        })
    }

    fn log_path(&self, target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        self.error_dir.join(format!("{}.log", name))
    }

    async fn write_log(&self, log: &Path, contents: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.error_dir).await?;
        tokio::fs::write(log, contents).await
    }
}

/// Check that the encoder program can be started and return its version line.
pub async fn check_encoder(program: &str) -> anyhow::Result<String> {
    let output = Command::new(program).arg("-version").output().await?;

    if !output.status.success() {
        return Err(anyhow::anyhow!("{} -version failed", program));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    Ok(version.lines().next().unwrap_or("unknown").to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn copy_duplicates_content() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.mp3");
        let dst = tmp.path().join("b.mp3");
        std::fs::write(&src, b"0123456789").unwrap();

        let exec = ConversionExecutor::new("unused", tmp.path().join("errors"));
        exec.exec(Encoder::Copy, &src, &dst, "copy").await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn failure_writes_log_and_removes_partial_target() {
        let tmp = TempDir::new().unwrap();
        let encoder = script(
            tmp.path(),
            "failing",
            r#"for a; do last="$a"; done; echo partial > "$last"; echo "bad input" >&2; exit 3"#,
        );
        let src = tmp.path().join("a.flac");
        let dst = tmp.path().join("a.mp3");
        std::fs::write(&src, b"flac").unwrap();

        let errors = tmp.path().join("errors");
        let exec = ConversionExecutor::new(encoder.to_string_lossy(), &errors);
        let err = exec.exec(Encoder::Mp3, &src, &dst, "vbr:2").await.unwrap_err();

        match err {
            ConversionError::Encoder { log, .. } => {
                assert_eq!(log, errors.join("a.mp3.log"));
                let text = std::fs::read_to_string(log).unwrap();
                assert!(text.contains("bad input"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let exec = ConversionExecutor::new("/nonexistent/encoder", tmp.path());
        let err = exec
            .exec(Encoder::Ogg, &tmp.path().join("a.flac"), &tmp.path().join("a.ogg"), "quality:6")
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Spawn { .. }));
    }
}
