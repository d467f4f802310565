use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use env_logger::Env;
use walkdir::WalkDir;

use vanguard_updater::UpdateError;
use vanguard_updater::lock::ClientLock;
use vanguard_updater::paths;
use vanguard_updater::util::strip_quotes;

const LOCK_WAIT: Duration = Duration::from_secs(30);
const SETTLE_DELAY: Duration = Duration::from_secs(1);
const LOG_FILE: &str = "SecondStageUpdater.log";

#[derive(Parser, Debug)]
#[command(
    name = "SecondStageUpdater",
    about = "Finalizes a staged update once the game client has exited"
)]
struct Cli {
    /// Executable name of the client that spawned this process.
    client_executable_name: String,
    /// Installation directory; may arrive wrapped in quotes.
    base_directory: String,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Argument errors share the single failure exit code instead of clap's
    // own.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };
    let base = PathBuf::from(strip_quotes(&cli.base_directory));
    let mut log = StageLog::create(&base);

    log.info(&format!(
        "Second-stage updater started for {} in {}",
        cli.client_executable_name,
        base.display()
    ));

    match run(&base, &mut log) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log.fatal(&err.to_string());
            ExitCode::FAILURE
        }
    }
}

fn run(base: &Path, log: &mut StageLog) -> Result<(), UpdateError> {
    let _lock = ClientLock::wait_acquire(LOCK_WAIT)?;
    log.info("Client exclusion lock acquired");

    // Give the operating system a moment to release file handles.
    std::thread::sleep(SETTLE_DELAY);

    let staging = paths::staging_dir(base);
    if !staging.is_dir() {
        return Err(UpdateError::FilesystemFailed(format!(
            "{} does not exist; nothing to finalize",
            staging.display()
        )));
    }

    for entry in WalkDir::new(&staging) {
        let entry = entry.map_err(|e| {
            UpdateError::FilesystemFailed(format!("failed to enumerate staged files: {e}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(&staging).map_err(|e| {
            UpdateError::FilesystemFailed(format!(
                "failed to relativize {}: {e}",
                entry.path().display()
            ))
        })?;

        if relative == Path::new(paths::VERSION_FILE) {
            // The manifest is promoted last, once the tree is consistent.
            continue;
        }
        if is_self_file(relative) {
            log.warn(&format!("Skipping own file {}", relative.display()));
            continue;
        }

        let target = base.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::FilesystemFailed(format!(
                    "failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        std::fs::copy(entry.path(), &target).map_err(|e| {
            UpdateError::FilesystemFailed(format!(
                "failed to copy {}: {e}",
                relative.display()
            ))
        })?;
        log.info(&format!("Updated {}", relative.display()));
    }

    let staged_manifest = staging.join(paths::VERSION_FILE);
    if staged_manifest.is_file() {
        std::fs::copy(&staged_manifest, base.join(paths::VERSION_FILE)).map_err(|e| {
            UpdateError::FilesystemFailed(format!("failed to promote the version manifest: {e}"))
        })?;
        log.info("Version manifest promoted");
    }

    let launcher = launcher_from_definitions(base)?;
    let launcher_path = paths::join_relative(base, &launcher);
    if !launcher_path.is_file() {
        log.warn(&format!("Launcher {} not found", launcher_path.display()));
        return Err(UpdateError::LauncherMissing(launcher));
    }

    log.info(&format!("Launching {}", launcher_path.display()));
    Command::new(&launcher_path)
        .current_dir(base)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            UpdateError::FilesystemFailed(format!(
                "failed to start {}: {e}",
                launcher_path.display()
            ))
        })?;
    Ok(())
}

/// Never overwrite the running bootstrap with a staged copy: the live
/// binary was already replaced before this process was spawned. The check
/// compares file stems, extension-insensitively, at the staging root and
/// under `Resources/`.
fn is_self_file(relative: &Path) -> bool {
    let Some(own_stem) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_os_string()))
    else {
        return false;
    };
    let Some(stem) = relative.file_stem() else {
        return false;
    };
    if stem != own_stem.as_os_str() {
        return false;
    }
    match relative.parent() {
        None => true,
        Some(parent) => {
            parent.as_os_str().is_empty() || parent == Path::new(paths::RESOURCES_DIR)
        }
    }
}

/// Pull the launcher executable name out of `Resources/ClientDefinitions.ini`.
fn launcher_from_definitions(base: &Path) -> Result<String, UpdateError> {
    #[cfg(windows)]
    const LAUNCHER_KEY: &str = "LauncherExe=";
    #[cfg(not(windows))]
    const LAUNCHER_KEY: &str = "UnixLauncherExe=";

    let definitions = paths::client_definitions_path(base);
    let text = std::fs::read_to_string(&definitions).map_err(|e| {
        UpdateError::FilesystemFailed(format!("failed to read {}: {e}", definitions.display()))
    })?;

    for line in text.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix(LAUNCHER_KEY) {
            let value = value.split(';').next().unwrap_or("").trim();
            if value.is_empty() {
                break;
            }
            return Ok(value.to_owned());
        }
    }
    Err(UpdateError::LauncherMissing(format!(
        "{} does not define a launcher executable",
        definitions.display()
    )))
}

/// Console reporter mirrored to `Client/SecondStageUpdater.log`: green for
/// progress, yellow for warnings, red for fatal errors.
struct StageLog {
    file: Option<std::fs::File>,
}

impl StageLog {
    fn create(base: &Path) -> Self {
        let dir = base.join("Client");
        let file = std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::File::create(dir.join(LOG_FILE)))
            .ok();
        Self { file }
    }

    fn info(&mut self, message: &str) {
        println!("{}", message.green());
        self.append(message);
    }

    fn warn(&mut self, message: &str) {
        println!("{}", message.yellow());
        self.append(&format!("WARNING: {message}"));
    }

    fn fatal(&mut self, message: &str) {
        eprintln!("{}", message.red());
        self.append(&format!("FATAL: {message}"));
    }

    fn append(&mut self, message: &str) {
        if let Some(file) = self.file.as_mut() {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "{stamp} {message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_key_is_parsed_with_comment_stripping() {
        let dir = tempfile::tempdir().unwrap();
        let resources = dir.path().join("Resources");
        std::fs::create_dir_all(&resources).unwrap();
        #[cfg(windows)]
        let content = "[Settings]\nLauncherExe=VanguardLauncher.exe ; main launcher\n";
        #[cfg(not(windows))]
        let content = "[Settings]\nUnixLauncherExe=VanguardLauncher ; main launcher\n";
        std::fs::write(resources.join("ClientDefinitions.ini"), content).unwrap();

        let launcher = launcher_from_definitions(dir.path()).unwrap();
        #[cfg(windows)]
        assert_eq!(launcher, "VanguardLauncher.exe");
        #[cfg(not(windows))]
        assert_eq!(launcher, "VanguardLauncher");
    }

    #[test]
    fn missing_definitions_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(launcher_from_definitions(dir.path()).is_err());
    }

    #[test]
    fn regular_files_are_not_mistaken_for_the_bootstrap() {
        assert!(!is_self_file(Path::new("game.dat")));
        assert!(!is_self_file(Path::new("Resources/other.dll")));
    }
}
