//! Demo playback scripts (`.vdm`) for chained demo playback.
//!
//! A script sits next to its demo (same stem, `.vdm` extension) and is picked
//! up by the engine when the demo is played. The scripts written here contain
//! two actions: one that fires shortly before the end of the demo and either
//! plays the next demo or exits, and one that speeds playback up from tick 0.
//!
//! The grammar is a brace-delimited key/value format. Values are written in
//! quotes without escaping, so anything containing `"` is rejected.
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const SCRIPT_EXTENSION: &str = "vdm";
/// Ticks subtracted from the demo's end tick so the end command still fires.
pub const END_TICK_MARGIN: i32 = 2;
pub const WAIT_COMMAND: &str = "wait 200";
pub const PLAYBACK_RATE: f32 = 10.0;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no end tick found for demo {}", capture.display())]
    MissingEndTick { capture: PathBuf },

    #[error("script value contains a quote: {value}")]
    InvalidArgument { value: String },

    #[error("failed to write script {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptAction {
    PlayCommands { name: String, start_tick: i32, commands: String },
    ChangePlaybackRate { name: String, start_tick: i32, rate: f32 },
}

impl ScriptAction {
    pub fn factory(&self) -> &'static str {
        match self {
            Self::PlayCommands { .. } => "PlayCommands",
            Self::ChangePlaybackRate { .. } => "ChangePlaybackRate",
        }
    }

    pub fn start_tick(&self) -> i32 {
        match self {
            Self::PlayCommands { start_tick, .. } | Self::ChangePlaybackRate { start_tick, .. } => *start_tick,
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::PlayCommands { name, .. } | Self::ChangePlaybackRate { name, .. } => name,
        }
    }
}

/// Ordered list of actions making up one script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DemoActions {
    actions: Vec<ScriptAction>,
}

impl DemoActions {
    /// Actions for a demo whose last tick is `end_tick`, chaining into `next`
    /// (a path relative to the game directory) or exiting when there is none.
    pub fn chained(end_tick: i32, next: Option<&str>) -> Self {
        let fire_at = (end_tick - END_TICK_MARGIN).max(0);
        Self {
            actions: vec![
                ScriptAction::PlayCommands {
                    name: "Execute command".into(),
                    start_tick: fire_at,
                    commands: end_command(next),
                },
                ScriptAction::ChangePlaybackRate {
                    name: "Play demo fast".into(),
                    start_tick: 0,
                    rate: PLAYBACK_RATE,
                },
            ],
        }
    }

    pub fn actions(&self) -> &[ScriptAction] {
        &self.actions
    }

    fn check_values(&self) -> Result<(), BuildError> {
        for action in &self.actions {
            let text = match action {
                ScriptAction::PlayCommands { name, commands, .. } => [name.as_str(), commands.as_str()],
                ScriptAction::ChangePlaybackRate { name, .. } => [name.as_str(), ""],
            };
            if let Some(value) = text.iter().find(|v| v.contains('"')) {
                return Err(BuildError::InvalidArgument { value: value.to_string() });
            }
        }
        Ok(())
    }
}

fn field(f: &mut fmt::Formatter<'_>, key: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(f, "        {key} \"{value}\"")
}

impl fmt::Display for DemoActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "demoactions")?;
        writeln!(f, "{{")?;
        for (idx, action) in self.actions.iter().enumerate() {
            writeln!(f, "    \"{}\"", idx + 1)?;
            writeln!(f, "    {{")?;
            field(f, "factory", action.factory())?;
            field(f, "name", action.name())?;
            field(f, "starttick", action.start_tick())?;
            match action {
                ScriptAction::PlayCommands { commands, .. } => field(f, "commands", commands)?,
                ScriptAction::ChangePlaybackRate { rate, .. } => field(f, "playbackrate", format_args!("{rate:.6}"))?,
            }
            writeln!(f, "    }}")?;
        }
        write!(f, "}}")
    }
}

/// Command run at the end of a demo: wait, then play `next` or quit.
pub fn end_command(next: Option<&str>) -> String {
    match next {
        Some(next) => format!("{WAIT_COMMAND}; playdemo {next}"),
        None => format!("{WAIT_COMMAND}; exit"),
    }
}

/// `foo/bar.dem` -> `foo/bar.vdm`.
pub fn script_path(capture: impl AsRef<Path>) -> PathBuf {
    capture.as_ref().with_extension(SCRIPT_EXTENSION)
}

/// Render the script text without touching the filesystem.
pub fn render(end_tick: i32, next: Option<&str>) -> Result<String, BuildError> {
    let actions = DemoActions::chained(end_tick, next);
    actions.check_values()?;
    Ok(actions.to_string())
}

/// Write the chained playback script for `capture` and return its path.
///
/// `end_tick` is the demo's last non-negative tick; `None` and `Some(0)` mean
/// the demo never advanced and fail with [`BuildError::MissingEndTick`] before
/// anything is written. An existing script at the target path is replaced.
pub fn build(capture: impl AsRef<Path>, end_tick: Option<i32>, next: Option<&Path>) -> Result<PathBuf, BuildError> {
    let capture = capture.as_ref();
    let end_tick = match end_tick {
        Some(tick) if tick > 0 => tick,
        _ => return Err(BuildError::MissingEndTick { capture: capture.to_path_buf() }),
    };
    let next = next.map(|p| p.display().to_string());
    let contents = render(end_tick, next.as_deref())?;
    let path = script_path(capture);
    fs::write(&path, contents).map_err(|source| BuildError::Io { path: path.clone(), source })?;
    info!(script = %path.display(), end_tick, next = next.as_deref().unwrap_or("<exit>"), "wrote playback script");
    Ok(path)
}
