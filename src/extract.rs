#![forbid(unsafe_code)]

//! Extraction is delegated to yt-dlp compatible command line tools. Several
//! tools can be configured; they are tried in order and the first one that
//! succeeds wins.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::MediaFormat;

/// Tagged result of a single strategy attempt.
#[derive(Debug)]
pub enum ExtractionOutcome<T> {
    Completed(T),
    /// The tool cannot handle this URL or is not installed.
    Unsupported(String),
    /// The platform wants a signed-in user (age or membership gates).
    RequiresAuth(String),
    /// Anything else; another tool may still succeed.
    Transient(String),
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no extractor supports this URL: {0}")]
    Unsupported(String),
    #[error("this video requires a signed-in user: {0}")]
    RequiresAuth(String),
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("extraction task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

/// What to download and where to put it. The tool picks the extension, so the
/// output is identified by `stem` inside `output_dir`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: MediaFormat,
    pub output_dir: PathBuf,
    pub stem: String,
}

pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn probe(&self, url: &str) -> ExtractionOutcome<VideoInfo>;

    fn download(&self, request: &DownloadRequest) -> ExtractionOutcome<PathBuf>;
}

/// Ordered list of strategies.
pub struct ExtractionChain {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl ExtractionChain {
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    /// One [`CommandExtractor`] per configured program, sharing a cookies
    /// file when it exists.
    pub fn from_programs(programs: &[String], cookies: &Path) -> Self {
        let cookies = cookies.exists().then(|| cookies.to_path_buf());
        let strategies = programs
            .iter()
            .map(|program| {
                Box::new(CommandExtractor::new(program, cookies.clone()))
                    as Box<dyn ExtractionStrategy>
            })
            .collect();
        Self::new(strategies)
    }

    pub fn probe(&self, url: &str) -> Result<VideoInfo, ExtractionError> {
        self.first_completed(|strategy| strategy.probe(url))
    }

    pub fn download(&self, request: &DownloadRequest) -> Result<PathBuf, ExtractionError> {
        self.first_completed(|strategy| strategy.download(request))
    }

    fn first_completed<T>(
        &self,
        attempt: impl Fn(&dyn ExtractionStrategy) -> ExtractionOutcome<T>,
    ) -> Result<T, ExtractionError> {
        let mut auth: Option<String> = None;
        let mut transient: Option<String> = None;
        let mut unsupported = Vec::new();

        for strategy in &self.strategies {
            match attempt(strategy.as_ref()) {
                ExtractionOutcome::Completed(value) => {
                    debug!(extractor = strategy.name(), "extraction succeeded");
                    return Ok(value);
                }
                ExtractionOutcome::Unsupported(reason) => {
                    debug!(extractor = strategy.name(), %reason, "extractor unsupported");
                    unsupported.push(format!("{}: {reason}", strategy.name()));
                }
                ExtractionOutcome::RequiresAuth(reason) => {
                    warn!(extractor = strategy.name(), %reason, "extractor needs sign-in");
                    auth = Some(reason);
                }
                ExtractionOutcome::Transient(reason) => {
                    warn!(extractor = strategy.name(), %reason, "extractor failed; trying next");
                    transient = Some(format!("{}: {reason}", strategy.name()));
                }
            }
        }

        if let Some(reason) = auth {
            return Err(ExtractionError::RequiresAuth(reason));
        }
        if let Some(reason) = transient {
            return Err(ExtractionError::Failed(reason));
        }
        if unsupported.is_empty() {
            return Err(ExtractionError::Unsupported("no extractors configured".into()));
        }
        Err(ExtractionError::Unsupported(unsupported.join("; ")))
    }
}

/// Runs a yt-dlp compatible program (yt-dlp itself, youtube-dl, forks).
pub struct CommandExtractor {
    program: String,
    cookies: Option<PathBuf>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<String>, cookies: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cookies,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("--no-playlist").arg("--no-warnings");
        if let Some(cookies) = &self.cookies {
            command.arg("--cookies").arg(cookies);
        }
        command
    }

    fn run(&self, mut command: Command) -> Result<Output, ExtractionOutcome<()>> {
        match command.output() {
            Ok(output) if output.status.success() => Ok(output),
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(classify_failure(&stderr, &output.status.to_string()))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(
                ExtractionOutcome::Unsupported(format!("{} is not installed", self.program)),
            ),
            Err(err) => Err(ExtractionOutcome::Transient(format!(
                "launching {}: {err}",
                self.program
            ))),
        }
    }
}

impl ExtractionStrategy for CommandExtractor {
    fn name(&self) -> &str {
        &self.program
    }

    fn probe(&self, url: &str) -> ExtractionOutcome<VideoInfo> {
        let mut command = self.command();
        command.arg("--dump-single-json").arg("--skip-download").arg(url);
        let output = match self.run(command) {
            Ok(output) => output,
            Err(outcome) => return outcome.retag(),
        };
        match serde_json::from_slice::<VideoInfo>(&output.stdout) {
            Ok(info) => ExtractionOutcome::Completed(info),
            Err(err) => ExtractionOutcome::Transient(format!("parsing metadata: {err}")),
        }
    }

    fn download(&self, request: &DownloadRequest) -> ExtractionOutcome<PathBuf> {
        if let Err(err) = fs::create_dir_all(&request.output_dir) {
            return ExtractionOutcome::Transient(format!(
                "creating {}: {err}",
                request.output_dir.display()
            ));
        }
        let template = request.output_dir.join(format!("{}.%(ext)s", request.stem));

        let mut command = self.command();
        command
            .args(format_args_for(request.format))
            .arg("--no-overwrites")
            .arg("--output")
            .arg(&template)
            .arg(&request.url);
        if let Err(outcome) = self.run(command) {
            return outcome.retag();
        }

        match find_output(&request.output_dir, &request.stem) {
            Some(path) => ExtractionOutcome::Completed(path),
            None => ExtractionOutcome::Transient(format!(
                "{} reported success but produced no file",
                self.program
            )),
        }
    }
}

impl ExtractionOutcome<()> {
    fn retag<T>(self) -> ExtractionOutcome<T> {
        match self {
            Self::Completed(()) => ExtractionOutcome::Transient("unexpected success".into()),
            Self::Unsupported(reason) => ExtractionOutcome::Unsupported(reason),
            Self::RequiresAuth(reason) => ExtractionOutcome::RequiresAuth(reason),
            Self::Transient(reason) => ExtractionOutcome::Transient(reason),
        }
    }
}

/// Maps extractor stderr onto an outcome tag.
pub fn classify_failure(stderr: &str, status: &str) -> ExtractionOutcome<()> {
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| format!("exited with {status}"));

    if stderr.contains("Sign in")
        || stderr.contains("age-restricted")
        || stderr.contains("confirm your age")
    {
        ExtractionOutcome::RequiresAuth(message)
    } else if stderr.contains("Unsupported URL") {
        ExtractionOutcome::Unsupported(message)
    } else {
        ExtractionOutcome::Transient(message)
    }
}

/// Extractor arguments selecting streams for each output format.
pub fn format_args_for(format: MediaFormat) -> Vec<&'static str> {
    match format {
        MediaFormat::Mp4 => vec![
            "--format",
            "bv*[ext=mp4]+ba[ext=m4a]/b[ext=mp4]/bv*+ba/b",
            "--merge-output-format",
            "mp4",
        ],
        MediaFormat::Webm => vec![
            "--format",
            "bv*[ext=webm]+ba[ext=webm]/b[ext=webm]/bv*+ba/b",
            "--merge-output-format",
            "webm",
        ],
        MediaFormat::Mp3 => vec![
            "--format",
            "bestaudio/best",
            "--extract-audio",
            "--audio-format",
            "mp3",
        ],
        MediaFormat::Opus => vec![
            "--format",
            "bestaudio/best",
            "--extract-audio",
            "--audio-format",
            "opus",
        ],
        MediaFormat::Best => vec!["--format", "bv*+ba/b"],
    }
}

/// Finds the finished file named `<stem>.<ext>`, ignoring partial downloads.
fn find_output(dir: &Path, stem: &str) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .find(|path| {
            let stem_matches = path.file_stem().and_then(|s| s.to_str()) == Some(stem);
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            stem_matches && !matches!(ext, "part" | "ytdl" | "tmp" | "")
        })
}
