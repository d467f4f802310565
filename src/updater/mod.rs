use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::components::CustomComponent;
use crate::config::UpdaterConfig;
use crate::download::DownloadEngine;
use crate::error::{Result, UpdateError};
use crate::hashing::try_file_identifier;
use crate::manifest::{Manifest, NO_VERSION};
use crate::mirrors::MirrorList;
use crate::paths;
use crate::reconcile::{self, Plan};
use crate::script::run_script_file;
use crate::transport::{Transport, UserAgent};
use crate::util::cancel_requested;

pub mod state;

pub use state::{UpdaterEvent, VersionState};

/// Host-supplied identity and preferences, fixed for the updater's
/// lifetime.
#[derive(Debug, Clone, Default)]
pub struct UpdaterOptions {
    /// Game name for the transport's identification header.
    pub game_name: String,
    /// Version of the hosting shell.
    pub host_version: String,
    /// Executable the second stage relaunches, passed through verbatim.
    pub client_executable_name: String,
    /// Mirror names the user prefers, in order, from the host's settings.
    pub preferred_mirror_names: Vec<String>,
}

/// The update orchestrator. Owns all mutable update state (version state,
/// the current plan, counters, the mirror list) and reports to the host
/// through the event channel handed in at construction. Intended to live on
/// a background task; the host only observes events.
pub struct Updater {
    root: PathBuf,
    options: UpdaterOptions,
    mirrors: MirrorList,
    current_mirror_index: usize,
    state: VersionState,
    local_manifest: Manifest,
    server_manifest: Option<Manifest>,
    plan: Plan,
    update_size_in_kb: u64,
    total_downloaded_kbs: u64,
    manual_update_required: bool,
    manual_download_url: String,
    ignore_masks: Vec<String>,
    components: Vec<CustomComponent>,
    transport: Transport,
    events: mpsc::UnboundedSender<UpdaterEvent>,
    cancel_flag: Arc<AtomicBool>,
}

impl Updater {
    pub fn new(
        root: impl Into<PathBuf>,
        options: UpdaterOptions,
        events: mpsc::UnboundedSender<UpdaterEvent>,
    ) -> Result<Self> {
        let root = root.into();
        let config = UpdaterConfig::load(&root)?;
        let mut mirrors = MirrorList::new(config.mirrors.clone());
        mirrors.apply_user_priority(&options.preferred_mirror_names);
        let local_manifest = Manifest::read_or_default(&paths::local_manifest_path(&root));

        Ok(Self {
            root,
            options,
            mirrors,
            current_mirror_index: 0,
            state: VersionState::Unknown,
            local_manifest,
            server_manifest: None,
            plan: Plan::default(),
            update_size_in_kb: 0,
            total_downloaded_kbs: 0,
            manual_update_required: false,
            manual_download_url: String::new(),
            ignore_masks: config.ignore_masks,
            components: config.components,
            transport: Transport::new(),
            events,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn state(&self) -> VersionState {
        self.state
    }

    #[must_use]
    pub fn update_size_in_kb(&self) -> u64 {
        self.update_size_in_kb
    }

    #[must_use]
    pub fn total_downloaded_kbs(&self) -> u64 {
        self.total_downloaded_kbs
    }

    #[must_use]
    pub fn manual_update_required(&self) -> bool {
        self.manual_update_required
    }

    #[must_use]
    pub fn manual_download_url(&self) -> &str {
        &self.manual_download_url
    }

    #[must_use]
    pub fn current_mirror_index(&self) -> usize {
        self.current_mirror_index
    }

    #[must_use]
    pub fn local_manifest(&self) -> &Manifest {
        &self.local_manifest
    }

    #[must_use]
    pub fn components(&self) -> &[CustomComponent] {
        &self.components
    }

    /// Mirror reordering is routed through the orchestrator so all mirror
    /// mutation stays single-writer.
    pub fn move_mirror_up(&mut self, index: usize) {
        self.mirrors.move_up(index);
    }

    pub fn move_mirror_down(&mut self, index: usize) {
        self.mirrors.move_down(index);
    }

    /// Cancellation token consulted between files and by in-flight
    /// transfers. Hand a clone to the host UI.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Request that a running update stop at the next cancellation point.
    pub fn cancel_update(&self) {
        warn!("updater: cancellation requested");
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Fetch the server manifest (trying mirrors in order), diff it against
    /// the installation, and settle into `UpToDate` or `Outdated`.
    pub async fn check_for_updates(&mut self) -> Result<()> {
        match self.state {
            VersionState::UpdateCheckInProgress | VersionState::UpdateInProgress => {
                warn!("updater: version check rejected, already busy");
                return Ok(());
            }
            _ => {}
        }
        self.set_state(VersionState::UpdateCheckInProgress);
        info!("version_check: starting");

        match self.version_check_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("version_check: failed: {err}");
                self.set_state(VersionState::Unknown);
                self.emit(UpdaterEvent::UpdateFailed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn version_check_inner(&mut self) -> Result<()> {
        self.local_manifest = Manifest::read_or_default(&paths::local_manifest_path(&self.root));

        let temp_manifest = paths::temp_manifest_path(&self.root);
        self.fetch_from_mirrors(paths::VERSION_FILE, &temp_manifest).await?;
        let server = Manifest::read(&temp_manifest)?;
        if server.game_version.is_empty() {
            return Err(UpdateError::ManifestMalformed(
                "server manifest carries no Version".into(),
            ));
        }
        info!(
            "version_check: server at {} (local {})",
            server.game_version,
            if self.local_manifest.game_version.is_empty() {
                "none"
            } else {
                self.local_manifest.game_version.as_str()
            }
        );

        self.refresh_components(&server).await;

        if server.game_version == self.local_manifest.game_version {
            self.plan = Plan::default();
            self.update_size_in_kb = 0;
            self.manual_update_required = false;
            self.server_manifest = Some(server);
            self.set_state(VersionState::UpToDate);
            if reconcile::components_outdated(&self.root, &self.components) {
                self.emit(UpdaterEvent::CustomComponentsOutdated);
            }
            return Ok(());
        }

        if server.updater_version != NO_VERSION
            && server.updater_version != self.local_manifest.updater_version
        {
            warn!(
                "version_check: updater generation moved from {} to {}, manual update required",
                self.local_manifest.updater_version, server.updater_version
            );
            self.manual_update_required = true;
            self.manual_download_url = server.manual_download_url.clone();
            self.plan = Plan::default();
            self.update_size_in_kb = 0;
            self.server_manifest = Some(server);
            self.set_state(VersionState::Outdated);
            return Ok(());
        }

        self.manual_update_required = false;
        self.plan = self.build_plan_blocking(&server).await;
        self.update_size_in_kb = self.plan.total_kb;
        self.server_manifest = Some(server);
        self.set_state(VersionState::Outdated);
        Ok(())
    }

    /// Run the whole update sequence: pre-script, local verification,
    /// re-plan, downloads, post-script, finalize.
    pub async fn start_update(&mut self) -> Result<()> {
        if self.state != VersionState::Outdated {
            warn!("updater: start rejected in state {:?}", self.state);
            return Ok(());
        }
        if self.manual_update_required {
            warn!("updater: start rejected, manual update required");
            return Ok(());
        }

        self.cancel_flag.store(false, Ordering::SeqCst);
        self.set_state(VersionState::UpdateInProgress);
        info!("update: starting");

        match self.update_inner().await {
            Ok(()) => Ok(()),
            Err(UpdateError::Cancelled) => {
                // Not a failure: staged files stay for the next attempt.
                warn!("update: cancelled by the user");
                self.cancel_flag.store(false, Ordering::SeqCst);
                self.set_state(VersionState::Outdated);
                Ok(())
            }
            Err(err) => {
                error!("update: failed: {err}");
                self.set_state(VersionState::Unknown);
                self.emit(UpdaterEvent::UpdateFailed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn update_inner(&mut self) -> Result<()> {
        let mirror_url = self
            .mirrors
            .get(self.current_mirror_index)
            .ok_or(UpdateError::MirrorExhausted)?
            .url
            .clone();

        self.fetch_and_run_script(&mirror_url, paths::PRE_UPDATE_SCRIPT).await;

        self.verify_local_versions().await;
        self.emit(UpdaterEvent::FileIdentifiersUpdated);
        self.emit(UpdaterEvent::LocalFileVersionsChecked);

        let server = self
            .server_manifest
            .clone()
            .ok_or_else(|| UpdateError::ManifestMalformed("no server manifest loaded".into()))?;
        self.plan = self.build_plan_blocking(&server).await;
        self.update_size_in_kb = self.plan.total_kb;
        self.total_downloaded_kbs = 0;

        let entries = self.plan.entries.clone();
        let total_kb = self.update_size_in_kb;
        let user_agent = self.user_agent();
        let events = self.events.clone();

        for entry in &entries {
            if cancel_requested(&Some(self.cancel_flag.clone())) {
                return Err(UpdateError::Cancelled);
            }

            let done_kb = self.total_downloaded_kbs;
            let entry_kb = u64::from(entry.download_size());
            let current_file = entry.path.clone();
            let progress_events = events.clone();
            let mut on_progress = move |file_percent: f32, _bytes: u64| {
                let total_percent = if total_kb > 0 {
                    ((done_kb as f32 + file_percent / 100.0 * entry_kb as f32)
                        / total_kb as f32)
                        * 100.0
                } else {
                    0.0
                };
                let _ = progress_events.send(UpdaterEvent::UpdateProgressChanged {
                    current_file: current_file.clone(),
                    file_percent,
                    total_percent,
                });
            };

            let mut engine = DownloadEngine::new(
                &self.root,
                &mut self.transport,
                &user_agent,
                Some(self.cancel_flag.clone()),
            );
            let archive_name = engine
                .fetch_entry(&mirror_url, entry, Some(&mut on_progress))
                .await?;

            self.total_downloaded_kbs += entry_kb;
            self.emit(UpdaterEvent::FileDownloadCompleted { archive_name });
            debug!(
                "update: {}/{} KB fetched",
                self.total_downloaded_kbs, self.update_size_in_kb
            );
        }

        if cancel_requested(&Some(self.cancel_flag.clone())) {
            return Err(UpdateError::Cancelled);
        }

        self.fetch_and_run_script(&mirror_url, paths::UPDATE_SCRIPT).await;
        self.finalize().await
    }

    /// Download `ini_name` through the regular pipeline, straight to its
    /// installation path. Rejected while an update runs.
    pub async fn download_component(&mut self, ini_name: &str) -> Result<()> {
        if self.state == VersionState::UpdateInProgress {
            warn!("updater: component download rejected during update");
            return Ok(());
        }
        let index = self
            .components
            .iter()
            .position(|c| c.ini_name == ini_name)
            .ok_or_else(|| {
                UpdateError::ConfigMissing(format!("unknown component {ini_name}"))
            })?;
        if !self.components[index].initialized || self.components[index].is_being_downloaded {
            warn!("updater: component {ini_name} not downloadable right now");
            return Ok(());
        }

        let mirror_url = self
            .mirrors
            .get(self.current_mirror_index)
            .ok_or(UpdateError::MirrorExhausted)?
            .url
            .clone();
        let component = {
            self.components[index].is_being_downloaded = true;
            self.components[index].clone()
        };
        let user_agent = self.user_agent();

        let mut engine = DownloadEngine::new(
            &self.root,
            &mut self.transport,
            &user_agent,
            Some(self.cancel_flag.clone()),
        );
        let result = engine.fetch_component(&mirror_url, &component, None).await;

        let slot = &mut self.components[index];
        slot.is_being_downloaded = false;
        match result {
            Ok(()) => {
                slot.local_identifier = slot.remote_identifier.clone();
                self.emit(UpdaterEvent::FileDownloadCompleted { archive_name: None });
                Ok(())
            }
            Err(err) => {
                error!("updater: component {ini_name} download failed: {err}");
                self.emit(UpdaterEvent::UpdateFailed(err.to_string()));
                Err(err)
            }
        }
    }

    fn set_state(&mut self, state: VersionState) {
        if self.state != state {
            debug!("updater: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(UpdaterEvent::VersionStateChanged(state));
        }
    }

    fn emit(&self, event: UpdaterEvent) {
        let _ = self.events.send(event);
    }

    fn user_agent(&self) -> UserAgent {
        UserAgent {
            game_name: self.options.game_name.clone(),
            updater_version: if self.local_manifest.updater_version.is_empty() {
                NO_VERSION.to_owned()
            } else {
                self.local_manifest.updater_version.clone()
            },
            game_version: self.local_manifest.game_version.clone(),
            host_version: self.options.host_version.clone(),
        }
    }

    /// Try mirrors starting at the current one; a mirror that fails advances
    /// the index, and falling off the end resets it and gives up.
    async fn fetch_from_mirrors(&mut self, remote_name: &str, destination: &Path) -> Result<()> {
        if self.mirrors.is_empty() {
            return Err(UpdateError::MirrorExhausted);
        }
        let user_agent = self.user_agent();
        loop {
            let mirror = self
                .mirrors
                .get(self.current_mirror_index)
                .cloned()
                .ok_or(UpdateError::MirrorExhausted)?;
            let url = format!("{}{remote_name}", mirror.url);
            info!("version_check: trying mirror {} ({url})", mirror.name);
            match self
                .transport
                .download(&url, destination, &user_agent, None, &None)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("version_check: mirror {} failed: {err}", mirror.name);
                    self.current_mirror_index += 1;
                    if self.current_mirror_index >= self.mirrors.len() {
                        self.current_mirror_index = 0;
                        return Err(UpdateError::MirrorExhausted);
                    }
                }
            }
        }
    }

    /// Refresh every component's remote fields from the server manifest and
    /// rehash its local payload.
    async fn refresh_components(&mut self, server: &Manifest) {
        let root = self.root.clone();
        let mut components = std::mem::take(&mut self.components);
        let server = server.clone();
        let refreshed = tokio::task::spawn_blocking(move || {
            for component in &mut components {
                match server.add_on(&component.ini_name) {
                    Some(entry) => {
                        component.remote_identifier = entry.identifier.clone();
                        component.remote_size = entry.size;
                        component.remote_archive_identifier = entry.archive_identifier.clone();
                        component.remote_archive_size = entry.archive_size;
                        component.archived = entry.archived();
                        component.initialized = true;
                    }
                    None => {
                        debug!("components: {} not tracked by server", component.ini_name);
                        component.initialized = false;
                    }
                }
                let local = paths::join_relative(&root, &component.local_path);
                component.local_identifier = if local.exists() {
                    try_file_identifier(&local).unwrap_or_default()
                } else {
                    String::new()
                };
            }
            components
        })
        .await
        .unwrap_or_default();
        self.components = refreshed;
    }

    async fn build_plan_blocking(&self, server: &Manifest) -> Plan {
        let root = self.root.clone();
        let local = self.local_manifest.clone();
        let server = server.clone();
        tokio::task::spawn_blocking(move || reconcile::build_plan(&root, &local, &server))
            .await
            .unwrap_or_default()
    }

    /// Drop vanished entries and rehash the rest so the plan is built
    /// against reality rather than a stale manifest.
    async fn verify_local_versions(&mut self) {
        let root = self.root.clone();
        let masks = self.ignore_masks.clone();
        let mut manifest = self.local_manifest.clone();
        let events = self.events.clone();
        let verified = tokio::task::spawn_blocking(move || {
            reconcile::verify_local_file_versions(&root, &mut manifest, &masks, |done, total| {
                let _ = events.send(UpdaterEvent::LocalFileCheckProgressChanged { done, total });
            });
            manifest
        })
        .await
        .unwrap_or_else(|_| self.local_manifest.clone());
        self.local_manifest = verified;
    }

    async fn finalize(&mut self) -> Result<()> {
        let temp_manifest = paths::temp_manifest_path(&self.root);
        let staging = paths::staging_dir(&self.root);

        if staging.exists() {
            // The second stage reads the staged manifest as the new truth,
            // so the move must land before the process is spawned.
            let staged_manifest = staging.join(paths::VERSION_FILE);
            move_file(&temp_manifest, &staged_manifest)?;
            self.promote_theme_override();
            self.promote_second_stage()?;
            self.spawn_second_stage()?;
            info!("update: handed off to the second stage");
            self.emit(UpdaterEvent::Restart);
            return Ok(());
        }

        // Nothing was staged: the update applied directly.
        move_file(&temp_manifest, &paths::local_manifest_path(&self.root))?;
        self.local_manifest = Manifest::read_or_default(&paths::local_manifest_path(&self.root));
        self.emit(UpdaterEvent::FileIdentifiersUpdated);
        self.set_state(VersionState::UpToDate);
        self.emit(UpdaterEvent::UpdateCompleted);
        info!("update: completed in place");
        Ok(())
    }

    fn promote_theme_override(&self) {
        let source = self.root.join(paths::THEME_STAGE_FILE);
        if !source.exists() {
            return;
        }
        let target = paths::join_relative(&self.root, paths::THEME_TARGET_FILE);
        if let Some(parent) = target.parent()
            && let Err(err) = std::fs::create_dir_all(parent)
        {
            warn!("update: unable to prepare theme dir: {err}");
            return;
        }
        if let Err(err) = std::fs::copy(&source, &target) {
            warn!("update: unable to promote theme override: {err}");
        }
    }

    /// Replace the live second-stage binary with the staged one so the
    /// handoff runs the freshly shipped version.
    fn promote_second_stage(&self) -> Result<()> {
        let staged = paths::staged_second_stage_path(&self.root);
        if !staged.exists() {
            return Ok(());
        }
        let live = paths::second_stage_path(&self.root);
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::FilesystemFailed(format!("unable to prepare Resources: {e}"))
            })?;
        }
        std::fs::copy(&staged, &live).map_err(|e| {
            UpdateError::FilesystemFailed(format!("unable to replace second stage: {e}"))
        })?;

        #[cfg(not(target_os = "windows"))]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&live, std::fs::Permissions::from_mode(0o755));
        }
        Ok(())
    }

    fn spawn_second_stage(&self) -> Result<()> {
        let binary = paths::second_stage_path(&self.root);
        info!("update: spawning {}", binary.display());
        Command::new(&binary)
            .arg(&self.options.client_executable_name)
            .arg(format!("\"{}\"", self.root.display()))
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                UpdateError::FilesystemFailed(format!(
                    "unable to start {}: {e}",
                    binary.display()
                ))
            })?;
        Ok(())
    }

    async fn fetch_and_run_script(&mut self, mirror_url: &str, name: &str) {
        let destination = self.root.join(name);
        let url = format!("{mirror_url}{name}");
        let user_agent = self.user_agent();
        match self
            .transport
            .download(&url, &destination, &user_agent, None, &None)
            .await
        {
            Ok(()) => {
                let root = self.root.clone();
                let script = destination.clone();
                let _ = tokio::task::spawn_blocking(move || run_script_file(&root, &script)).await;
            }
            Err(err) => {
                // Scripts are best-effort; a missing one is normal.
                warn!("script: unable to fetch {name}: {err}");
            }
        }
    }
}

fn move_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            UpdateError::FilesystemFailed(format!("unable to prepare {}: {e}", parent.display()))
        })?;
    }
    std::fs::rename(source, target).map_err(|e| {
        UpdateError::FilesystemFailed(format!(
            "unable to move {} to {}: {e}",
            source.display(),
            target.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::hashing::file_identifier;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = paths::join_relative(root, relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// Minimal one-shot HTTP responder: serves the routed bodies, 404s
    /// everything else.
    async fn spawn_mirror(routes: HashMap<&'static str, Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let read = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..read]).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_owned();
                    let response = match routes.get(path.as_str()) {
                        Some(body) => {
                            let mut head = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            head.extend_from_slice(body);
                            head
                        }
                        None => {
                            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_vec()
                        }
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/")
    }

    fn updater_with_mirrors(
        root: &Path,
        urls: &[String],
    ) -> (Updater, mpsc::UnboundedReceiver<UpdaterEvent>) {
        let mirrors = urls
            .iter()
            .enumerate()
            .map(|(i, url)| format!("{i}={url},Mirror {i}\n"))
            .collect::<String>();
        write(
            root,
            "Resources/UpdaterConfig.ini",
            &format!("[DownloadMirrors]\n{mirrors}"),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let updater = Updater::new(
            root,
            UpdaterOptions {
                game_name: "Vanguard".into(),
                host_version: "2.0".into(),
                client_executable_name: "client.exe".into(),
                preferred_mirror_names: Vec::new(),
            },
            tx,
        )
        .unwrap();
        (updater, rx)
    }

    fn updater_with_config(root: &Path) -> (Updater, mpsc::UnboundedReceiver<UpdaterEvent>) {
        write(
            root,
            "Resources/UpdaterConfig.ini",
            "[DownloadMirrors]\n0=http://127.0.0.1:9/a,A\n1=http://127.0.0.1:9/b,B\n",
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let updater = Updater::new(
            root,
            UpdaterOptions {
                game_name: "Vanguard".into(),
                host_version: "2.0".into(),
                client_executable_name: "client.exe".into(),
                preferred_mirror_names: Vec::new(),
            },
            tx,
        )
        .unwrap();
        (updater, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UpdaterEvent>) -> Vec<UpdaterEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn version_check_exhausts_dead_mirrors_and_resets_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, mut rx) = updater_with_config(dir.path());

        let result = updater.check_for_updates().await;
        assert!(matches!(result, Err(UpdateError::MirrorExhausted)));
        assert_eq!(updater.current_mirror_index(), 0);
        assert_eq!(updater.state(), VersionState::Unknown);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, UpdaterEvent::UpdateFailed(_))));
    }

    #[tokio::test]
    async fn start_update_outside_outdated_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, mut rx) = updater_with_config(dir.path());

        updater.start_update().await.unwrap();
        assert_eq!(updater.state(), VersionState::Unknown);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn direct_finalize_promotes_the_manifest_and_reports_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, mut rx) = updater_with_config(dir.path());

        write(dir.path(), "game.dat", "payload");
        let id = file_identifier(&dir.path().join("game.dat")).unwrap();
        write(
            dir.path(),
            "version_u",
            &format!("[DTA]\nVersion=1.17\n[FileVersions]\ngame.dat={id},1\n"),
        );

        updater.finalize().await.unwrap();
        assert_eq!(updater.state(), VersionState::UpToDate);
        assert!(!dir.path().join("version_u").exists());
        assert_eq!(updater.local_manifest().game_version, "1.17");
        assert_eq!(updater.local_manifest().file("game.dat").unwrap().identifier, id);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, UpdaterEvent::UpdateCompleted)));
    }

    #[tokio::test]
    async fn staged_finalize_moves_the_manifest_into_staging_first() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, mut rx) = updater_with_config(dir.path());

        write(dir.path(), "version_u", "[DTA]\nVersion=1.17\n");
        write(dir.path(), "Updater/game.dat", "staged payload");

        // The spawn of the (absent) second stage fails, but by then the
        // staged manifest must already be in place.
        let result = updater.finalize().await;
        assert!(result.is_err());
        assert!(dir.path().join("Updater").join("version").exists());
        assert!(!dir.path().join("version_u").exists());
        assert!(!drain(&mut rx).iter().any(|e| matches!(e, UpdaterEvent::Restart)));
    }

    #[tokio::test]
    async fn matching_versions_settle_into_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "version", "[DTA]\nVersion=1.0\n");
        let url = spawn_mirror(HashMap::from([(
            "/version",
            b"[DTA]\nVersion=1.0\n".to_vec(),
        )]))
        .await;
        let (mut updater, _rx) = updater_with_mirrors(dir.path(), &[url]);

        updater.check_for_updates().await.unwrap();
        assert_eq!(updater.state(), VersionState::UpToDate);
        assert_eq!(updater.update_size_in_kb(), 0);
        assert!(!updater.manual_update_required());
    }

    #[tokio::test]
    async fn diverged_updater_version_forces_the_manual_gate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "version", "[DTA]\nVersion=0.9\nUpdaterVersion=1\n");
        let manifest = b"[DTA]\nVersion=1.0\nUpdaterVersion=2\nManualDownloadURL=https://x\n\
            [FileVersions]\ngame.dat=111,10\n"
            .to_vec();
        let url = spawn_mirror(HashMap::from([("/version", manifest)])).await;
        let (mut updater, _rx) = updater_with_mirrors(dir.path(), &[url]);

        updater.check_for_updates().await.unwrap();
        assert_eq!(updater.state(), VersionState::Outdated);
        assert!(updater.manual_update_required());
        assert_eq!(updater.manual_download_url(), "https://x");
        assert_eq!(updater.update_size_in_kb(), 0);
        assert!(updater.plan.is_empty());
    }

    #[tokio::test]
    async fn failover_advances_past_a_broken_mirror_without_surfacing_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "version", "[DTA]\nVersion=1.0\n");
        let broken = spawn_mirror(HashMap::new()).await;
        let good = spawn_mirror(HashMap::from([(
            "/version",
            b"[DTA]\nVersion=1.0\n".to_vec(),
        )]))
        .await;
        let (mut updater, _rx) = updater_with_mirrors(dir.path(), &[broken, good]);

        updater.check_for_updates().await.unwrap();
        assert_eq!(updater.current_mirror_index(), 1);
        assert_eq!(updater.state(), VersionState::UpToDate);

        // A second check against the now-working mirror stays put.
        updater.check_for_updates().await.unwrap();
        assert_eq!(updater.current_mirror_index(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_file_update_stages_verifies_and_hands_off() {
        use std::io::Write as _;
        use xz2::stream::{LzmaOptions, Stream};
        use xz2::write::XzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let payload = b"fresh game data".repeat(64);
        let stream = Stream::new_lzma_encoder(&LzmaOptions::new_preset(6).unwrap()).unwrap();
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
        encoder.write_all(&payload).unwrap();
        let archive = encoder.finish().unwrap();

        let plain_id = {
            let tmp = root.join("expected");
            std::fs::write(&tmp, &payload).unwrap();
            let id = file_identifier(&tmp).unwrap();
            std::fs::remove_file(&tmp).unwrap();
            id
        };
        let archive_id = {
            let tmp = root.join("expected.lzma");
            std::fs::write(&tmp, &archive).unwrap();
            let id = file_identifier(&tmp).unwrap();
            std::fs::remove_file(&tmp).unwrap();
            id
        };

        write(root, "version", "[DTA]\nVersion=1.16\n[FileVersions]\ngame.dat=AAA,10\n");
        write(root, "game.dat", "stale content");

        // A stand-in bootstrap so the handoff spawn succeeds.
        let second_stage = paths::second_stage_path(root);
        std::fs::create_dir_all(second_stage.parent().unwrap()).unwrap();
        std::fs::write(&second_stage, "#!/bin/sh\nexit 0\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&second_stage, std::fs::Permissions::from_mode(0o755))
                .unwrap();
        }

        let manifest = format!(
            "[DTA]\nVersion=1.17\n[FileVersions]\ngame.dat={plain_id},10\n\
             [ArchivedFiles]\ngame.dat={archive_id},4\n"
        )
        .into_bytes();
        let url = spawn_mirror(HashMap::from([
            ("/version", manifest),
            ("/game.dat.lzma", archive),
        ]))
        .await;
        let (mut updater, mut rx) = updater_with_mirrors(root, &[url]);

        updater.check_for_updates().await.unwrap();
        assert_eq!(updater.state(), VersionState::Outdated);
        assert_eq!(updater.update_size_in_kb(), 4);

        updater.start_update().await.unwrap();

        let staged = paths::staged_path(root, "game.dat");
        assert_eq!(file_identifier(&staged).unwrap(), plain_id);
        assert!(!paths::staged_path(root, "game.dat.lzma").exists());
        assert!(root.join("Updater").join("version").exists());
        assert!(!root.join("version_u").exists());
        assert_eq!(updater.total_downloaded_kbs(), 4);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, UpdaterEvent::Restart)));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, UpdaterEvent::FileDownloadCompleted { archive_name: Some(_) }))
        );
    }

    #[tokio::test]
    async fn mirror_reordering_goes_through_the_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let (mut updater, _rx) = updater_with_config(dir.path());
        updater.move_mirror_down(0);
        assert_eq!(updater.mirrors.get(0).unwrap().name, "B");
        updater.move_mirror_up(1);
        assert_eq!(updater.mirrors.get(0).unwrap().name, "A");
    }
}
