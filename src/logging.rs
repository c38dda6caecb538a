use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Append-only transcript of the chat session.
///
/// Separate from the `tracing` diagnostics: this captures the rendered
/// conversation (messages, presence changes) as the user sees it.
pub struct TranscriptLog {
    file_path: Option<String>,
    is_active: bool,
}

impl TranscriptLog {
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let transcript = TranscriptLog {
            is_active: log_file.is_some(),
            file_path: log_file,
        };

        // Fail early if the requested file is not writable.
        if let Some(path) = transcript.file_path.clone() {
            transcript.test_file_access(&path)?;
        }

        Ok(transcript)
    }

    pub fn toggle(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        match &self.file_path {
            Some(path) => {
                self.is_active = !self.is_active;
                if self.is_active {
                    Ok(format!("Transcript resumed to: {}", path))
                } else {
                    Ok(format!("Transcript paused (file: {})", path))
                }
            }
            None => Err("No transcript file specified. Pass --log <filename> at startup.".into()),
        }
    }

    pub fn record(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        let file_path = match (&self.file_path, self.is_active) {
            (Some(path), true) => path,
            _ => return Ok(()),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        // Preserve the on-screen formatting line for line.
        for line in content.lines() {
            writeln!(file, "{}", line)?;
        }

        file.flush()?;
        Ok(())
    }

    pub fn status_string(&self) -> String {
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), active) => {
                let name = Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy();
                if active {
                    format!("active ({})", name)
                } else {
                    format!("paused ({})", name)
                }
            }
        }
    }

    fn test_file_access(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_while_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.log");
        let path_str = path.to_string_lossy().to_string();

        let mut transcript = TranscriptLog::new(Some(path_str)).unwrap();
        transcript.record("alice: hello").unwrap();
        transcript.toggle().unwrap();
        transcript.record("bob: dropped").unwrap();
        transcript.toggle().unwrap();
        transcript.record("alice: back").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("alice: hello"));
        assert!(contents.contains("alice: back"));
        assert!(!contents.contains("bob: dropped"));
    }

    #[test]
    fn disabled_without_file() {
        let transcript = TranscriptLog::new(None).unwrap();
        assert_eq!(transcript.status_string(), "disabled");
        transcript.record("ignored").unwrap();
    }

    #[test]
    fn toggle_without_file_errors() {
        let mut transcript = TranscriptLog::new(None).unwrap();
        assert!(transcript.toggle().is_err());
    }
}
