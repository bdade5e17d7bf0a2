//! Chaining every demo of a recorded session.
//!
//! A session folder holds the demos of one run in recording order. Each demo
//! gets a script that plays the following one, so starting playback of the
//! first demo plays back the whole run. The `playdemo` reference has to be
//! relative to the game directory, which is where the engine resolves it.
use crate::demo::{self, ScanError, ScanOptions};
use crate::vdm::{self, BuildError};
use crossbeam_channel::unbounded;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no .dem files in {}", dir.display())]
    Empty { dir: PathBuf },

    #[error("failed to scan {}: {source}", path.display())]
    Scan { path: PathBuf, source: ScanError },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct ChainOptions {
    pub session_dir: PathBuf,
    /// Directory the engine resolves `playdemo` paths against.
    pub game_dir: PathBuf,
    /// Scan workers; 0 picks the available parallelism.
    pub jobs: usize,
    pub scan: ScanOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedDemo {
    pub demo: PathBuf,
    pub script: PathBuf,
    pub end_tick: i32,
    /// Game-relative path of the demo played next, `None` for the last one.
    pub next: Option<String>,
}

/// `.dem` files in `dir`, oldest first (creation time, else modification
/// time), ties broken by file name.
pub fn collect_demos(dir: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let mut demos: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir.as_ref())? {
        let entry = entry?;
        let path = entry.path();
        let is_demo = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("dem"));
        let meta = entry.metadata()?;
        if !is_demo || !meta.is_file() {
            continue;
        }
        let stamp = meta.created().or_else(|_| meta.modified())?;
        demos.push((stamp, path));
    }
    demos.sort();
    Ok(demos.into_iter().map(|(_, path)| path).collect())
}

/// `path` relative to `game_dir`, `/`-separated. Paths outside the game
/// directory are returned as displayed.
pub fn game_relative(path: &Path, game_dir: &Path) -> String {
    match path.strip_prefix(game_dir) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.display().to_string(),
    }
}

/// Scan all demos on a worker pool; results come back in input order.
fn scan_all(demos: &[PathBuf], jobs: usize, options: &ScanOptions) -> Result<Vec<Option<i32>>, SessionError> {
    let workers = match jobs {
        0 => thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        n => n,
    }
    .min(demos.len())
    .max(1);

    let (job_tx, job_rx) = unbounded::<(usize, &Path)>();
    let (res_tx, res_rx) = unbounded::<(usize, Result<Option<i32>, ScanError>)>();
    for (idx, path) in demos.iter().enumerate() {
        job_tx.send((idx, path.as_path())).ok();
    }
    drop(job_tx);

    let mut ticks = vec![None; demos.len()];
    thread::scope(|s| -> Result<(), SessionError> {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            s.spawn(move || {
                for (idx, path) in job_rx {
                    let result = demo::scan_with(path, options);
                    if res_tx.send((idx, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(res_tx);
        for (idx, result) in res_rx {
            let tick = result.map_err(|source| SessionError::Scan { path: demos[idx].clone(), source })?;
            debug!(demo = %demos[idx].display(), ?tick, "scanned");
            ticks[idx] = tick;
        }
        Ok(())
    })?;
    Ok(ticks)
}

/// Scan every demo in the session and write a script chaining each into
/// the next. Nothing is written unless every demo scanned to a usable end
/// tick.
pub fn chain_session(options: &ChainOptions) -> Result<Vec<ChainedDemo>, SessionError> {
    let canonical = |p: &Path| fs::canonicalize(p).map_err(|source| SessionError::Io { path: p.to_path_buf(), source });
    let session_dir = canonical(&options.session_dir)?;
    let game_dir = canonical(&options.game_dir)?;

    let demos = collect_demos(&session_dir).map_err(|source| SessionError::Io { path: session_dir.clone(), source })?;
    if demos.is_empty() {
        return Err(SessionError::Empty { dir: session_dir });
    }
    info!(dir = %session_dir.display(), count = demos.len(), "chaining session");

    let ticks = scan_all(&demos, options.jobs, &options.scan)?;
    let end_ticks = demos
        .iter()
        .zip(ticks)
        .map(|(demo, tick)| match tick {
            Some(t) if t > 0 => Ok(t),
            _ => Err(BuildError::MissingEndTick { capture: demo.clone() }),
        })
        .collect::<Result<Vec<i32>, BuildError>>()?;

    let mut chained = Vec::with_capacity(demos.len());
    for (idx, (demo, end_tick)) in demos.iter().zip(end_ticks).enumerate() {
        let next = demos.get(idx + 1).map(|p| game_relative(p, &game_dir));
        let script = vdm::build(demo, Some(end_tick), next.as_deref().map(Path::new))?;
        chained.push(ChainedDemo { demo: demo.clone(), script, end_tick, next });
    }
    Ok(chained)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_relative_uses_forward_slashes() {
        let game = Path::new("/games/hl2");
        let demo = game.join("speedrun").join("run_1").join("d1_canals_01.dem");
        assert_eq!(game_relative(&demo, game), "speedrun/run_1/d1_canals_01.dem");
    }

    #[test]
    fn game_relative_outside_game_dir_is_unchanged() {
        let demo = Path::new("/elsewhere/d1_canals_01.dem");
        assert_eq!(game_relative(demo, Path::new("/games/hl2")), demo.display().to_string());
    }

    #[test]
    fn collect_demos_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.dem"), b"x").unwrap();
        fs::write(dir.path().join("a.vdm"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub.dem")).unwrap();
        let demos = collect_demos(dir.path()).unwrap();
        assert_eq!(demos, vec![dir.path().join("a.dem")]);
    }
}
