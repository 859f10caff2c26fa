//! Session lifecycle orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use buffet_shared::errors::{BuffetError, BuffetResult};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::catalogue::{ImageCatalogue, ImageEntry, ImageListing};
use crate::control::{ControlChannel, DisplayCredential, QmpControlChannel};
use crate::init_logging_for;
use crate::registry::{SessionRecord, SessionRegistry};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::lock::RuntimeLock;
use crate::runtime::options::BuffetOptions;
use crate::runtime::state::SessionStatus;
use crate::runtime::types::{
    DegradedReason, OwnerId, Provisioned, ProvisioningOutcome, Requester, SessionId,
    SessionSummary, SessionView,
};
use crate::slots::{Slot, SlotAllocator};
use crate::supervisor::{
    HostSupervisor, HypervisorLaunch, ManagedProcess, ProcessKind, ProcessSupervisor, ProxyLaunch,
};

// ============================================================================
// PUBLIC API
// ============================================================================

/// Entry point for creating and tearing down VM sessions.
///
/// **Lock Behavior**: Only one `BuffetRuntime` can use a given home
/// directory at a time. The filesystem lock is released when the last
/// clone is dropped.
///
/// **Cloning**: cheap; all clones share the same state.
#[derive(Clone)]
pub struct BuffetRuntime {
    inner: RuntimeInner,
}

pub(crate) type RuntimeInner = Arc<RuntimeInnerImpl>;

pub(crate) struct RuntimeInnerImpl {
    options: BuffetOptions,
    layout: FilesystemLayout,
    allocator: SlotAllocator,
    /// Swapped whole on reload; readers keep the snapshot they started with.
    catalogue: RwLock<Arc<ImageCatalogue>>,
    registry: SessionRegistry,
    supervisor: Arc<dyn ProcessSupervisor>,
    control: Arc<dyn ControlChannel>,
    /// Handles for processes this runtime spawned itself.
    live: Mutex<HashMap<SessionId, LiveProcesses>>,
    /// Reservations whose create is still running, flipped to `true` when it ends.
    provisioning: Mutex<HashMap<SessionId, watch::Receiver<bool>>>,
    _runtime_lock: RuntimeLock,
}

struct LiveProcesses {
    hypervisor: ManagedProcess,
    proxy: ManagedProcess,
}

impl BuffetRuntime {
    /// Create a runtime that launches real QEMU and websockify processes.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The options are invalid
    /// - Another runtime already holds the home directory
    /// - The catalogue or registry cannot be opened
    pub fn new(options: BuffetOptions) -> BuffetResult<Self> {
        options.validate()?;
        let supervisor = Arc::new(HostSupervisor::new(&options));
        let control = Arc::new(QmpControlChannel::new(options.control.clone()));
        Self::with_supervisor(options, supervisor, control)
    }

    /// Create a runtime with caller-supplied process and control seams.
    pub fn with_supervisor(
        options: BuffetOptions,
        supervisor: Arc<dyn ProcessSupervisor>,
        control: Arc<dyn ControlChannel>,
    ) -> BuffetResult<Self> {
        options.validate()?;

        let layout = options.layout();
        layout.prepare().map_err(|e| {
            BuffetError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let runtime_lock = RuntimeLock::acquire(layout.home_dir())?;

        let catalogue = ImageCatalogue::load(&layout.catalogue_path(), &layout.logos_dir())?;
        let registry = SessionRegistry::open(&layout.db_path())?;

        let inner = Arc::new(RuntimeInnerImpl {
            allocator: SlotAllocator::from_options(&options),
            options,
            layout,
            catalogue: RwLock::new(Arc::new(catalogue)),
            registry,
            supervisor,
            control,
            live: Mutex::new(HashMap::new()),
            provisioning: Mutex::new(HashMap::new()),
            _runtime_lock: runtime_lock,
        });

        tracing::debug!(
            home = %inner.layout.home_dir().display(),
            max_sessions = inner.allocator.max_sessions(),
            "initialized runtime"
        );

        Ok(Self { inner })
    }

    /// Boot a VM for `owner` from the catalogue entry `image_ref`.
    ///
    /// A failed credential step still yields a session; the returned
    /// [`ProvisioningOutcome`] says whether the display is protected.
    ///
    /// Provisioning runs on its own task: dropping the returned future does
    /// not abandon a half-started session.
    pub async fn create(&self, owner: &OwnerId, image_ref: &str) -> BuffetResult<Provisioned> {
        // Fast path only; the reservation insert is the real guard
        if self.inner.registry.get_by_owner(owner)?.is_some() {
            return Err(BuffetError::AlreadyHasSession(owner.to_string()));
        }

        let catalogue = self.catalogue();
        let image = catalogue
            .lookup(image_ref)
            .cloned()
            .ok_or_else(|| BuffetError::UnknownImage(image_ref.to_string()))?;

        let runtime = self.clone();
        let owner = owner.clone();
        tokio::spawn(async move { runtime.provision(owner, image).await })
            .await
            .map_err(|e| BuffetError::Internal(format!("provisioning task failed: {}", e)))?
    }

    /// Tear down a session.
    ///
    /// Only the owner or an admin may destroy it. Termination problems are
    /// logged, never returned: the row is always deleted so the slot frees.
    pub async fn destroy(&self, requester: &Requester, session_id: &str) -> BuffetResult<()> {
        let record = self.find_for(requester, session_id)?;
        self.destroy_record(record).await
    }

    /// Destroy whatever session `owner` holds, for logout, ban and account
    /// deletion. Returns the id of the destroyed session, if any.
    ///
    /// A create still in flight is waited for and then torn down.
    pub async fn release_owner(&self, owner: &OwnerId) -> BuffetResult<Option<SessionId>> {
        let Some(record) = self.inner.registry.get_by_owner(owner)? else {
            return Ok(None);
        };
        let id = record.id.clone();
        match self.destroy_record(record).await {
            Ok(()) => Ok(Some(id)),
            // The create failed and already released its reservation
            Err(BuffetError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The running session of `owner`.
    pub fn get(&self, owner: &OwnerId) -> BuffetResult<SessionView> {
        self.inner
            .registry
            .get_by_owner(owner)?
            .filter(|record| record.status.is_running())
            .map(|record| self.view_of(record))
            .ok_or_else(|| BuffetError::NotFound(format!("no session for {}", owner)))
    }

    /// A running session by id, subject to the same access rule as destroy.
    pub fn get_by_id(&self, requester: &Requester, session_id: &str) -> BuffetResult<SessionView> {
        let record = self.find_for(requester, session_id)?;
        if !record.status.is_running() {
            return Err(BuffetError::NotFound(format!("session {}", session_id)));
        }
        Ok(self.view_of(record))
    }

    /// Number of running sessions.
    pub fn count(&self) -> BuffetResult<usize> {
        self.inner.registry.count_running()
    }

    /// Operator inventory of every row, including in-flight ones.
    pub fn list(&self) -> BuffetResult<Vec<SessionSummary>> {
        Ok(self
            .inner
            .registry
            .list()?
            .iter()
            .map(SessionRecord::summary)
            .collect())
    }

    /// Current catalogue snapshot.
    pub fn catalogue(&self) -> Arc<ImageCatalogue> {
        Arc::clone(&self.inner.catalogue.read())
    }

    /// Catalogue entries with logos inlined.
    pub fn images(&self) -> Vec<ImageListing> {
        self.catalogue().listing()
    }

    /// Re-read `index.json` and publish it as the new snapshot.
    ///
    /// On error the previous snapshot stays in place.
    pub fn reload_catalogue(&self) -> BuffetResult<usize> {
        let layout = &self.inner.layout;
        let fresh = ImageCatalogue::load(&layout.catalogue_path(), &layout.logos_dir())?;
        let count = fresh.len();
        *self.inner.catalogue.write() = Arc::new(fresh);
        Ok(count)
    }

    /// Force every registry row through teardown, whatever its status and
    /// whether or not its processes still exist.
    ///
    /// Meant for service start and exit. Returns the number of rows cleared.
    pub async fn sweep(&self) -> BuffetResult<usize> {
        let records = self.inner.registry.list()?;
        let total = records.len();

        for record in records {
            tracing::info!(
                session_id = %record.id,
                owner = %record.owner_id,
                status = %record.status,
                "Sweeping session"
            );
            self.teardown(&record).await;
        }

        if total > 0 {
            tracing::info!(sessions = total, "Sweep complete");
        }
        Ok(total)
    }

    pub fn options(&self) -> &BuffetOptions {
        &self.inner.options
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.inner.layout
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl BuffetRuntime {
    async fn provision(&self, owner: OwnerId, image: ImageEntry) -> BuffetResult<Provisioned> {
        // Released on return, once the row is running or gone
        let (record, _in_flight) = self.reserve(&owner, &image)?;
        let session_id = record.id.clone();

        tracing::info!(
            session_id = %session_id,
            owner = %owner,
            image = image.image_ref(),
            slot = record.slot,
            "Provisioning session"
        );

        match self.launch(&record, image.clone()).await {
            Ok((live, credential, outcome)) => {
                let display_credential = credential.map(DisplayCredential::into_inner);
                self.inner.live.lock().insert(session_id.clone(), live);

                if let ProvisioningOutcome::SucceededDegraded(reason) = &outcome {
                    tracing::warn!(session_id = %session_id, %reason, "Session running degraded");
                }
                tracing::info!(
                    session_id = %session_id,
                    public_port = record.public_port,
                    "Session running"
                );

                Ok(Provisioned {
                    view: SessionView {
                        id: session_id,
                        public_port: record.public_port,
                        image_ref: record.image_ref,
                        owner_id: record.owner_id,
                        display_credential,
                        catalogue_metadata: Some(image.metadata()),
                    },
                    outcome,
                })
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, "Provisioning failed: {}", e);
                self.release_reservation(&session_id);
                Err(e)
            }
        }
    }

    /// Claim a slot and the owner in one insert, retrying when another
    /// create took the chosen slot first.
    ///
    /// The reservation is registered as in flight under the same lock, so
    /// anyone who sees the row also sees the pending create.
    fn reserve(
        &self,
        owner: &OwnerId,
        image: &ImageEntry,
    ) -> BuffetResult<(SessionRecord, InFlight)> {
        let registry = &self.inner.registry;
        let allocator = &self.inner.allocator;
        let layout = &self.inner.layout;
        let mut pending = self.inner.provisioning.lock();

        for _ in 0..=allocator.max_sessions() {
            let slot = allocator.allocate(registry.occupied_slots()?)?;
            let record = SessionRecord::reservation(
                owner.clone(),
                allocator.ports(slot),
                image.image_ref(),
                layout.control_socket(slot.index()),
                layout.traffic_log(owner.as_str(), image.image_ref(), Local::now()),
            );

            match registry.reserve(&record) {
                Ok(()) => {
                    let (done, waiter) = watch::channel(false);
                    pending.insert(record.id.clone(), waiter);
                    let in_flight = InFlight {
                        inner: Arc::clone(&self.inner),
                        id: record.id.clone(),
                        done,
                    };
                    return Ok((record, in_flight));
                }
                Err(BuffetError::SlotTaken(slot)) => {
                    tracing::debug!(slot, "Slot claimed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(BuffetError::CapacityExhausted {
            max: allocator.max_sessions(),
        })
    }

    /// Start both processes for a reserved row and mark it running.
    ///
    /// Anything started here is terminated again before an error returns.
    async fn launch(
        &self,
        record: &SessionRecord,
        image: ImageEntry,
    ) -> BuffetResult<(LiveProcesses, Option<DisplayCredential>, ProvisioningOutcome)> {
        let inner = &self.inner;
        let ports = inner.allocator.ports(Slot::new(record.slot));

        let launched = inner
            .supervisor
            .start_hypervisor(&HypervisorLaunch {
                session_id: record.id.clone(),
                owner: record.owner_id.clone(),
                image,
                ports,
                control_socket: record.control_socket.clone(),
                traffic_log: record.traffic_log.clone(),
            })
            .await?;
        let hypervisor = launched.process;

        if let Err(e) =
            inner
                .registry
                .record_process(&record.id, ProcessKind::Hypervisor, hypervisor.pid())
        {
            self.terminate_logged(hypervisor).await;
            return Err(e);
        }

        let (credential, outcome) = if launched.capabilities.display_credential {
            match inner
                .control
                .set_display_credential(&record.control_socket)
                .await
            {
                Ok(credential) => (Some(credential), ProvisioningOutcome::FullySucceeded),
                Err(e) => (
                    None,
                    ProvisioningOutcome::SucceededDegraded(DegradedReason::ControlChannel(
                        e.to_string(),
                    )),
                ),
            }
        } else {
            (
                None,
                ProvisioningOutcome::SucceededDegraded(DegradedReason::CredentialUnsupported),
            )
        };

        let proxy = match inner
            .supervisor
            .start_proxy(&ProxyLaunch {
                session_id: record.id.clone(),
                ports,
            })
            .await
        {
            Ok(proxy) => proxy,
            Err(e) => {
                self.terminate_logged(hypervisor).await;
                return Err(e);
            }
        };

        if let Err(e) = inner.registry.mark_running(
            &record.id,
            hypervisor.pid(),
            proxy.pid(),
            credential.as_ref().map(DisplayCredential::expose),
        ) {
            self.terminate_logged(proxy).await;
            self.terminate_logged(hypervisor).await;
            return Err(e);
        }

        Ok((LiveProcesses { hypervisor, proxy }, credential, outcome))
    }

    /// Resolve `session_id` and check the requester may act on it.
    fn find_for(&self, requester: &Requester, session_id: &str) -> BuffetResult<SessionRecord> {
        let not_found = || BuffetError::NotFound(format!("session {}", session_id));
        let id = SessionId::parse(session_id).ok_or_else(not_found)?;
        let record = self.inner.registry.get(&id)?.ok_or_else(not_found)?;

        if !requester.may_act_on(&record.owner_id) {
            return Err(BuffetError::Forbidden(format!(
                "session {} belongs to another user",
                session_id
            )));
        }
        Ok(record)
    }

    async fn destroy_record(&self, record: SessionRecord) -> BuffetResult<()> {
        let record = match record.status {
            SessionStatus::Provisioning => self.settle_provisioning(record).await?,
            _ => record,
        };

        self.inner
            .registry
            .set_status(&record.id, SessionStatus::Terminating)?;
        tracing::info!(session_id = %record.id, owner = %record.owner_id, "Destroying session");

        self.teardown(&record).await;
        Ok(())
    }

    /// Wait for the create behind a provisioning row, then re-read the row.
    ///
    /// A row still provisioning afterwards has no create left to finish it
    /// and is torn down like any other.
    async fn settle_provisioning(&self, record: SessionRecord) -> BuffetResult<SessionRecord> {
        let pending = self.inner.provisioning.lock().get(&record.id).cloned();
        if let Some(mut done) = pending {
            tracing::debug!(session_id = %record.id, "Waiting for in-flight create");
            // Err means the create task went away, which also ends it
            let _ = done.wait_for(|finished| *finished).await;
        }

        self.inner
            .registry
            .get(&record.id)?
            .ok_or_else(|| BuffetError::NotFound(format!("session {}", record.id)))
    }

    /// Terminate both processes and delete the row. Every step runs even if
    /// an earlier one fails; the delete always happens last.
    async fn teardown(&self, record: &SessionRecord) {
        let live = self.inner.live.lock().remove(&record.id);
        let processes = match live {
            Some(live) => vec![live.proxy, live.hypervisor],
            None => [
                (record.proxy_pid, ProcessKind::Proxy),
                (record.hypervisor_pid, ProcessKind::Hypervisor),
            ]
            .into_iter()
            .filter_map(|(pid, kind)| pid.map(|pid| ManagedProcess::from_pid(pid, kind)))
            .collect(),
        };

        for process in processes {
            self.terminate_logged(process).await;
        }

        remove_if_empty(&record.traffic_log);
        remove_quietly(&record.control_socket);

        if let Err(e) = self.inner.registry.delete(&record.id) {
            tracing::error!(session_id = %record.id, "Failed to delete session row: {}", e);
        }
    }

    async fn terminate_logged(&self, process: ManagedProcess) {
        let pid = process.pid();
        let kind = process.kind();
        if let Err(e) = self.inner.supervisor.terminate(process).await {
            tracing::warn!(pid, kind = %kind, "Failed to terminate process: {}", e);
        }
    }

    fn release_reservation(&self, id: &SessionId) {
        if let Err(e) = self.inner.registry.delete(id) {
            tracing::error!(session_id = %id, "Failed to release reservation: {}", e);
        }
    }

    fn view_of(&self, record: SessionRecord) -> SessionView {
        let catalogue_metadata = self.catalogue().metadata(&record.image_ref);
        SessionView {
            id: record.id,
            public_port: record.public_port,
            image_ref: record.image_ref,
            owner_id: record.owner_id,
            display_credential: record.display_credential,
            catalogue_metadata,
        }
    }
}

/// Marks a reservation as owned by a running create until dropped.
struct InFlight {
    inner: RuntimeInner,
    id: SessionId,
    done: watch::Sender<bool>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.provisioning.lock().remove(&self.id);
        self.done.send_replace(true);
    }
}

/// Captures with no traffic are noise.
fn remove_if_empty(path: &std::path::Path) {
    if let Ok(meta) = std::fs::metadata(path)
        && meta.len() == 0
    {
        remove_quietly(path);
    }
}

fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), "Failed to remove file: {}", e);
    }
}

impl std::fmt::Debug for BuffetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuffetRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .finish()
    }
}

impl std::fmt::Debug for RuntimeInnerImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("home_dir", &self.layout.home_dir())
            .field("max_sessions", &self.allocator.max_sessions())
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<BuffetRuntime>;
};
