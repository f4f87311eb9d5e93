//! One connection to one audio server.

use crate::allocator::{BlockAllocator, NodeIdAllocator};
use crate::bus::{BusGroup, Rate};
use crate::error::{Result, SwitchboardError};
use crate::synthdefs::SynthDef;
use oscwire::requests::{self, AddAction, Batch};
use oscwire::{
    request, Launcher, NodeId, OscPacket, Pattern, QueryTreeGroup, Response, ServerOptions,
    ServerProcess, Transport, WireError, READY_BANNER,
};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Group every mixer hangs off.
pub const DEFAULT_GROUP: NodeId = 1;

const FIRST_NODE_ID: NodeId = 1000;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootStatus {
    Offline,
    Booting,
    Online,
    Quitting,
}

impl fmt::Display for BootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BootStatus::Offline => "OFFLINE",
            BootStatus::Booting => "BOOTING",
            BootStatus::Online => "ONLINE",
            BootStatus::Quitting => "QUITTING",
        })
    }
}

/// A server connection plus everything scoped to one boot of it: the
/// process, the transport, the id allocators and the loaded definitions.
///
/// Remote mutations are queued with [`Context::submit`] and go out in order
/// on [`Context::flush`].
pub struct Context {
    options: ServerOptions,
    synthdef_dir: PathBuf,
    release_grace: Duration,
    status: BootStatus,
    epoch: u64,
    process: Option<Box<dyn ServerProcess>>,
    transport: Option<Arc<dyn Transport>>,
    node_ids: NodeIdAllocator,
    audio_buses: BlockAllocator,
    control_buses: BlockAllocator,
    synthdefs: BTreeSet<String>,
    next_sync_id: i32,
    outbox: Vec<Batch>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("address", &self.options.address())
            .field("status", &self.status)
            .field("epoch", &self.epoch)
            .field("pending", &self.outbox.len())
            .finish()
    }
}

impl Context {
    pub fn new(options: ServerOptions, synthdef_dir: PathBuf, release_grace: Duration) -> Self {
        let audio_buses = BlockAllocator::new(
            options.first_private_audio_bus() as i32,
            options.private_audio_bus_count(),
        );
        let control_buses = BlockAllocator::new(0, options.control_bus_channels);
        Self {
            options,
            synthdef_dir,
            release_grace,
            status: BootStatus::Offline,
            epoch: 0,
            process: None,
            transport: None,
            node_ids: NodeIdAllocator::new(FIRST_NODE_ID),
            audio_buses,
            control_buses,
            synthdefs: BTreeSet::new(),
            next_sync_id: 0,
            outbox: Vec::new(),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub fn status(&self) -> BootStatus {
        self.status
    }

    pub fn is_online(&self) -> bool {
        self.status == BootStatus::Online
    }

    /// Bumped on every boot; bus handles from older boots are ignored.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn release_grace(&self) -> Duration {
        self.release_grace
    }

    pub fn synthdefs(&self) -> &BTreeSet<String> {
        &self.synthdefs
    }

    /// Hardware output channels, starting at bus 0.
    pub fn output_bus(&self) -> BusGroup {
        BusGroup {
            rate: Rate::Audio,
            index: 0,
            count: self.options.output_channels,
            epoch: self.epoch,
        }
    }

    fn transport(&self) -> Result<&Arc<dyn Transport>> {
        match (&self.transport, self.status) {
            (Some(transport), BootStatus::Booting | BootStatus::Online) => Ok(transport),
            _ => Err(SwitchboardError::ContextOffline),
        }
    }

    /// Launch the server, wait for it to report ready and set up the default
    /// group. A failure at any step shuts down whatever was started.
    pub async fn boot(&mut self, launcher: &dyn Launcher) -> Result<()> {
        if self.status != BootStatus::Offline {
            return Ok(());
        }
        self.status = BootStatus::Booting;
        self.reset();
        self.epoch += 1;

        match self.start(launcher).await {
            Ok(()) => {
                self.status = BootStatus::Online;
                info!(address = %self.options.address(), epoch = self.epoch, "context online");
                Ok(())
            }
            Err(e) => {
                warn!(address = %self.options.address(), error = %e, "boot failed, tearing down");
                self.teardown().await;
                self.status = BootStatus::Offline;
                Err(e)
            }
        }
    }

    async fn start(&mut self, launcher: &dyn Launcher) -> Result<()> {
        self.options.resolve_port()?;
        let process = self.process.insert(launcher.launch(&self.options).await?);

        let boot_timeout = self.options.boot_timeout;
        match tokio::time::timeout(boot_timeout, process.wait_ready()).await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(WireError::Timeout {
                    after: boot_timeout,
                    waiting_for: READY_BANNER.to_string(),
                }
                .into())
            }
        }

        let transport = launcher.connect(&self.options).await?;
        self.transport = Some(Arc::clone(&transport));

        request(
            transport.as_ref(),
            OscPacket::Message(requests::notify(true)),
            Pattern::new("/done").with_arg("/notify".to_string()),
            self.options.reply_timeout,
        )
        .await?;

        let mut batch = Batch::new();
        batch.push(requests::group_new(DEFAULT_GROUP, AddAction::Head, 0));
        self.submit(batch);
        self.sync().await
    }

    /// Send `/quit` and shut the process down. Errors along the way are
    /// logged, never raised.
    pub async fn quit(&mut self) {
        if self.status != BootStatus::Online {
            return;
        }
        self.status = BootStatus::Quitting;
        self.outbox.clear();
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send(OscPacket::Message(requests::quit())).await {
                warn!(error = %e, "failed to send /quit");
            }
        }
        self.teardown().await;
        self.status = BootStatus::Offline;
        info!(address = %self.options.address(), "context offline");
    }

    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(mut process) = self.process.take() {
            process.shutdown(SHUTDOWN_GRACE).await;
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.node_ids.reset();
        self.audio_buses.reset();
        self.control_buses.reset();
        self.synthdefs.clear();
        self.outbox.clear();
        self.next_sync_id = 0;
    }

    pub(crate) fn next_node_id(&mut self) -> NodeId {
        self.node_ids.allocate()
    }

    pub(crate) fn allocate_bus(&mut self, rate: Rate, count: u32) -> Result<BusGroup> {
        let allocator = match rate {
            Rate::Audio => &mut self.audio_buses,
            Rate::Control => &mut self.control_buses,
        };
        let index = allocator
            .allocate(count)
            .ok_or(SwitchboardError::Exhausted { rate, count })?;
        Ok(BusGroup {
            rate,
            index,
            count,
            epoch: self.epoch,
        })
    }

    /// Return `bus` to its allocator. Handles from an earlier boot are
    /// ignored.
    pub(crate) fn free_bus(&mut self, bus: BusGroup) -> bool {
        if bus.epoch != self.epoch {
            debug!(%bus, epoch = self.epoch, "ignoring stale bus handle");
            return false;
        }
        let allocator = match bus.rate {
            Rate::Audio => &mut self.audio_buses,
            Rate::Control => &mut self.control_buses,
        };
        allocator.free(bus.index).is_some()
    }

    /// Live (allocated and not yet freed) audio and control bus blocks.
    pub fn live_buses(&self) -> (usize, usize) {
        (self.audio_buses.live(), self.control_buses.live())
    }

    /// Queue `batch` for the next flush. Empty batches are dropped.
    pub(crate) fn submit(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.outbox.push(batch);
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let transport = Arc::clone(self.transport()?);
        for batch in std::mem::take(&mut self.outbox) {
            transport.send(batch.into_packet()?).await?;
        }
        Ok(())
    }

    /// Flush, then wait until the server has processed everything sent.
    pub async fn sync(&mut self) -> Result<()> {
        self.flush().await?;
        let transport = Arc::clone(self.transport()?);
        let id = self.next_sync_id;
        self.next_sync_id += 1;
        request(
            transport.as_ref(),
            OscPacket::Message(requests::sync(id)),
            Pattern::new("/synced").with_arg(id),
            self.options.reply_timeout,
        )
        .await?;
        Ok(())
    }

    /// Load `synthdefs` and wait for the server to confirm.
    pub(crate) async fn upload_synthdefs(&mut self, synthdefs: &[SynthDef]) -> Result<()> {
        if synthdefs.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::new();
        for synthdef in synthdefs {
            debug!(synthdef = synthdef.name, "uploading synthdef");
            batch.push(match synthdef.compiled {
                Some(bytes) => requests::synthdef_receive(bytes.to_vec()),
                None => requests::synthdef_load(
                    &self.synthdef_dir.join(format!("{}.scsyndef", synthdef.name)),
                ),
            });
        }
        self.submit(batch);
        self.sync().await?;
        self.synthdefs
            .extend(synthdefs.iter().map(|synthdef| synthdef.name.to_string()));
        Ok(())
    }

    /// Fetch the node tree under `group`, controls included.
    pub async fn query_tree(&mut self, group: NodeId) -> Result<QueryTreeGroup> {
        self.flush().await?;
        let transport = Arc::clone(self.transport()?);
        let response = request(
            transport.as_ref(),
            OscPacket::Message(requests::query_tree(group, true)),
            Pattern::new("/g_queryTree.reply"),
            self.options.reply_timeout,
        )
        .await?;
        match response {
            Response::QueryTree(tree) => Ok(tree),
            other => Err(WireError::Malformed {
                address: "/g_queryTree.reply".to_string(),
                reason: format!("unexpected reply {other:?}"),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthdefs;
    use oscwire::{BootBehavior, LoopbackLauncher};

    fn context() -> Context {
        Context::new(
            ServerOptions::default(),
            PathBuf::from("/synthdefs"),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn boot_creates_the_default_group() {
        let launcher = LoopbackLauncher::new(synthdefs::descriptors());
        let mut context = context();
        context.boot(&launcher).await.unwrap();

        assert!(context.is_online());
        let engine = launcher.latest().unwrap();
        assert!(engine.has_node(DEFAULT_GROUP));
        assert_eq!(context.epoch(), 1);
    }

    #[tokio::test]
    async fn stale_bus_handles_are_not_freed() {
        let launcher = LoopbackLauncher::new(synthdefs::descriptors());
        let mut context = context();
        context.boot(&launcher).await.unwrap();
        let bus = context.allocate_bus(Rate::Audio, 2).unwrap();
        assert_eq!(bus.index, 16);

        context.quit().await;
        context.boot(&launcher).await.unwrap();
        let fresh = context.allocate_bus(Rate::Audio, 2).unwrap();
        assert_eq!(fresh.index, 16);
        assert!(!context.free_bus(bus));
        assert_eq!(context.live_buses(), (1, 0));
        assert!(context.free_bus(fresh));
    }

    #[tokio::test]
    async fn synthdefs_load_from_the_definition_directory() {
        let launcher = LoopbackLauncher::new(synthdefs::descriptors());
        let mut context = context();
        context.boot(&launcher).await.unwrap();
        context
            .upload_synthdefs(&[synthdefs::METERS_2])
            .await
            .unwrap();

        let engine = launcher.latest().unwrap();
        assert_eq!(engine.loaded_synthdefs(), vec!["switchboard:meters:2".to_string()]);
        let load = engine
            .sent_messages()
            .into_iter()
            .find(|message| message.addr == "/d_load")
            .unwrap();
        assert_eq!(
            load.args,
            vec![oscwire::OscType::String(
                "/synthdefs/switchboard:meters:2.scsyndef".to_string()
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_boot_times_out_and_cleans_up() {
        let launcher = LoopbackLauncher::new(synthdefs::descriptors());
        launcher.set_behavior(BootBehavior::Stall);
        let mut context = context();

        let result = context.boot(&launcher).await;
        assert!(matches!(
            result,
            Err(SwitchboardError::Wire(WireError::Timeout { .. }))
        ));
        assert_eq!(context.status(), BootStatus::Offline);
        assert_eq!(launcher.live_processes(), 0);
    }

    #[tokio::test]
    async fn offline_context_refuses_to_sync() {
        let mut context = context();
        assert!(matches!(
            context.sync().await,
            Err(SwitchboardError::ContextOffline)
        ));
    }
}
