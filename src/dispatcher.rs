//! The CAN dispatcher.
//!
//! Owns the bus interfaces, pumps the bounded send queue, and demultiplexes
//! incoming frames back to the in-flight `Command` they answer, keyed by
//! `(command_id, uid)`. One reader task runs per interface; a single send
//! loop preserves enqueue order on the wire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::BusInterface;
use crate::codec;
use crate::commands::{Command, CommandID, CommandStatus, Reply, UidPool};
use crate::error::Result;

/// Capacity of the send queue; a full queue blocks producers.
pub const SEND_QUEUE_SIZE: usize = 64;

type CommandKey = (CommandID, u8);
type RouteMap = HashMap<u16, (usize, Option<usize>)>;

/// In-flight command table plus the uid pools that feed it.
///
/// A uid is released only when its command leaves the table, so a late
/// reply can never be attributed to a newer command.
#[derive(Default)]
struct Running {
    map: Mutex<HashMap<CommandKey, Arc<Command>>>,
    pools: Mutex<HashMap<CommandID, UidPool>>,
    freed: Notify,
}

impl Running {
    async fn acquire_uid(&self, command_id: CommandID) -> u8 {
        loop {
            let freed = self.freed.notified();
            {
                let mut pools = self.pools.lock().unwrap();
                if let Some(uid) = pools.entry(command_id).or_default().acquire() {
                    return uid;
                }
            }
            warn!(command = ?command_id, "uid pool exhausted, waiting for a free slot");
            freed.await;
        }
    }

    fn insert(&self, command: Arc<Command>) {
        let key = (command.command_id(), command.uid());
        self.map.lock().unwrap().insert(key, command);
    }

    fn get(&self, key: CommandKey) -> Option<Arc<Command>> {
        self.map.lock().unwrap().get(&key).cloned()
    }

    fn remove(&self, key: CommandKey) {
        if self.map.lock().unwrap().remove(&key).is_some() {
            self.pools.lock().unwrap().entry(key.0).or_default().release(key.1);
            self.freed.notify_waiters();
        }
    }

    fn commands(&self) -> Vec<Arc<Command>> {
        self.map.lock().unwrap().values().cloned().collect()
    }

    fn prune_done(&self) {
        let done: Vec<CommandKey> = self
            .map
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, cmd)| cmd.status().is_done())
            .map(|(key, _)| *key)
            .collect();
        for key in done {
            self.remove(key);
        }
    }
}

pub struct CanDispatcher {
    interfaces: Vec<Arc<dyn BusInterface>>,
    multibus: bool,
    queue_tx: mpsc::Sender<Arc<Command>>,
    running: Arc<Running>,
    routes: Arc<Mutex<RouteMap>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CanDispatcher {
    /// Starts the dispatcher over the given interfaces, spawning the send
    /// loop and one reader task per interface.
    pub fn start(interfaces: Vec<Arc<dyn BusInterface>>) -> Arc<CanDispatcher> {
        let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        let running = Arc::new(Running::default());
        let routes: Arc<Mutex<RouteMap>> = Arc::new(Mutex::new(HashMap::new()));
        let multibus = interfaces.iter().any(|iface| iface.num_buses() > 1);

        let dispatcher = Arc::new(CanDispatcher {
            interfaces: interfaces.clone(),
            multibus,
            queue_tx,
            running: Arc::clone(&running),
            routes: Arc::clone(&routes),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(send_loop(
            queue_rx,
            interfaces.clone(),
            Arc::clone(&running),
            Arc::clone(&routes),
        )));
        for (index, iface) in interfaces.iter().enumerate() {
            tasks.push(tokio::spawn(read_loop(
                index,
                Arc::clone(iface),
                Arc::clone(&running),
            )));
        }
        *dispatcher.tasks.lock().unwrap() = tasks;

        dispatcher
    }

    pub fn num_interfaces(&self) -> usize {
        self.interfaces.len()
    }

    /// `true` when any interface exposes more than one bus.
    pub fn multibus(&self) -> bool {
        self.multibus
    }

    /// Queues a command for dispatch. Awaits when the queue is full.
    pub async fn enqueue(&self, command: Arc<Command>) -> Result<()> {
        self.queue_tx
            .send(command)
            .await
            .map_err(|_| crate::error::JaegerError::CanNotStarted)
    }

    /// Writes a command to the wire immediately, bypassing the queue.
    ///
    /// No tracking is done and errors are swallowed; reserved for emergency
    /// stop and abort commands.
    pub async fn send_now(&self, command: &Command) {
        if let Err(err) = write_frames(&self.interfaces, &self.routes, command, 0).await {
            warn!(command = ?command.command_id(), "emergency send failed: {err}");
        }
    }

    /// Records the interface/bus a positioner answers on.
    pub fn set_route(&self, positioner_id: u16, interface: usize, bus: Option<usize>) {
        self.routes.lock().unwrap().insert(positioner_id, (interface, bus));
    }

    pub fn clear_routes(&self) {
        self.routes.lock().unwrap().clear();
    }

    /// Tracked commands currently in flight.
    pub fn running_commands(&self) -> Vec<Arc<Command>> {
        self.running.commands()
    }

    /// Drops tracked commands that already reached a terminal status.
    pub fn refresh_running_commands(&self) {
        self.running.prune_done();
    }

    /// Aborts the send loop and the reader tasks.
    pub fn stop(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for command in self.running.commands() {
            command.cancel(true);
        }
        self.running.prune_done();
    }
}

fn resolve_route(routes: &Mutex<RouteMap>, n_interfaces: usize, pid: u16) -> Vec<(usize, Option<usize>)> {
    if pid != 0 {
        if let Some(&route) = routes.lock().unwrap().get(&pid) {
            return vec![route];
        }
    }
    // Unknown positioner or broadcast: fan out to every interface.
    (0..n_interfaces).map(|index| (index, None)).collect()
}

async fn write_frames(
    interfaces: &[Arc<dyn BusInterface>],
    routes: &Mutex<RouteMap>,
    command: &Command,
    uid: u8,
) -> Result<()> {
    for &pid in command.positioner_ids() {
        let frames = codec::encode(command.command_id(), pid, uid, command.data());
        for (index, bus) in resolve_route(routes, interfaces.len(), pid) {
            for frame in &frames {
                interfaces[index].send(bus, frame.clone()).await?;
            }
        }
    }
    Ok(())
}

async fn send_loop(
    mut queue_rx: mpsc::Receiver<Arc<Command>>,
    interfaces: Vec<Arc<dyn BusInterface>>,
    running: Arc<Running>,
    routes: Arc<Mutex<RouteMap>>,
) {
    while let Some(command) = queue_rx.recv().await {
        if command.status().is_done() {
            // Cancelled while still queued.
            continue;
        }

        let uid = running.acquire_uid(command.command_id()).await;
        command.set_uid(uid);
        running.insert(Arc::clone(&command));
        command.mark_running();

        trace!(command = ?command.command_id(), uid, "dispatching command");

        if let Err(err) = write_frames(&interfaces, &routes, &command, uid).await {
            warn!(command = ?command.command_id(), uid, "write failed: {err}");
            command.finish(CommandStatus::Failed);
            running.remove((command.command_id(), uid));
            continue;
        }

        tokio::spawn(monitor(command, Arc::clone(&running)));
    }
}

/// Waits a command out: completion, timeout, or (for broadcasts with an
/// unknown population) a quiescence window re-armed on every reply.
async fn monitor(command: Arc<Command>, running: Arc<Running>) {
    let key = (command.command_id(), command.uid());

    if command.expected_replies().is_some() {
        tokio::select! {
            _ = tokio::time::sleep(command.timeout()) => {
                if command.finish(CommandStatus::TimedOut) {
                    debug!(
                        command = ?command.command_id(),
                        uid = command.uid(),
                        elapsed = ?command.elapsed(),
                        "command timed out"
                    );
                }
            }
            _ = command.wait() => {}
        }
    } else {
        let window = command.timeout();
        loop {
            let anchor = command.last_reply_at().unwrap_or_else(|| command.created_at());
            let deadline = tokio::time::Instant::from_std(anchor + window);
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let quiet = command
                        .last_reply_at()
                        .map_or(true, |last| last.elapsed() >= window);
                    if quiet {
                        command.finish(CommandStatus::Done);
                        break;
                    }
                }
                _ = command.wait() => break,
            }
        }
    }

    running.remove(key);
}

async fn read_loop(index: usize, iface: Arc<dyn BusInterface>, running: Arc<Running>) {
    while let Some((bus, frame)) = iface.recv().await {
        let (identifier, data) = match codec::decode(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(interface = iface.name(), "dropping malformed frame: {err}");
                continue;
            }
        };

        let key = (identifier.command_id, identifier.uid);
        let Some(command) = running.get(key) else {
            trace!(
                interface = iface.name(),
                command = ?identifier.command_id,
                uid = identifier.uid,
                "stale reply dropped"
            );
            continue;
        };

        let reply = Reply {
            positioner_id: identifier.positioner_id,
            command_id: identifier.command_id,
            uid: identifier.uid,
            response_code: identifier.response_code,
            data: data.to_vec(),
            interface: index,
            bus,
        };

        if !command.add_reply(reply) {
            continue;
        }

        if let Some(status) = command.check_complete() {
            command.finish(status);
            running.remove(key);
        }
    }
    warn!(interface = iface.name(), "bus interface disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VirtualBus;
    use crate::commands::ResponseCode;
    use std::time::Duration;

    fn virtual_dispatcher(n: u16) -> (Arc<CanDispatcher>, Arc<VirtualBus>) {
        let bus = Arc::new(VirtualBus::new("virt").with_positioners(n));
        let dispatcher = CanDispatcher::start(vec![bus.clone() as Arc<dyn BusInterface>]);
        (dispatcher, bus)
    }

    #[tokio::test]
    async fn test_unicast_command_completes() {
        let (dispatcher, _bus) = virtual_dispatcher(3);

        let command = Arc::new(Command::new(CommandID::GetStatus, vec![2]));
        dispatcher.enqueue(Arc::clone(&command)).await.unwrap();

        assert_eq!(command.wait().await, CommandStatus::Done);
        let replies = command.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].positioner_id, 2);
        assert_eq!(replies[0].response_code, ResponseCode::CommandAccepted);

        // The tracking entry is gone once the command completes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.running_commands().is_empty());
    }

    #[tokio::test]
    async fn test_multicast_command_waits_for_all_replies() {
        let (dispatcher, _bus) = virtual_dispatcher(5);

        let command = Arc::new(Command::new(CommandID::GetActualPosition, vec![1, 3, 5]));
        dispatcher.enqueue(Arc::clone(&command)).await.unwrap();

        assert_eq!(command.wait().await, CommandStatus::Done);
        assert_eq!(command.positions().len(), 3);
    }

    #[tokio::test]
    async fn test_silent_positioner_times_out() {
        let (dispatcher, bus) = virtual_dispatcher(2);
        bus.set_respond(2, false);

        let command = Arc::new(
            Command::new(CommandID::GetStatus, vec![2]).with_timeout(Duration::from_millis(100)),
        );
        dispatcher.enqueue(Arc::clone(&command)).await.unwrap();

        assert_eq!(command.wait().await, CommandStatus::TimedOut);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.running_commands().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_quiescence_discovers_population() {
        let (dispatcher, _bus) = virtual_dispatcher(3);

        let command = Arc::new(
            Command::broadcast(CommandID::GetFirmwareVersion)
                .with_timeout(Duration::from_millis(150)),
        );
        dispatcher.enqueue(Arc::clone(&command)).await.unwrap();

        assert_eq!(command.wait().await, CommandStatus::Done);
        assert_eq!(command.firmware_versions().len(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.running_commands().is_empty());
    }

    #[tokio::test]
    async fn test_stale_reply_is_dropped() {
        let (dispatcher, bus) = virtual_dispatcher(1);

        // An untracked emergency send produces a reply with no owner.
        let command = Command::new(CommandID::GetStatus, vec![1]);
        dispatcher.send_now(&command).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.running_commands().is_empty());

        // The dispatcher keeps working afterwards.
        let tracked = Arc::new(Command::new(CommandID::GetStatus, vec![1]));
        dispatcher.enqueue(Arc::clone(&tracked)).await.unwrap();
        assert_eq!(tracked.wait().await, CommandStatus::Done);
        let _ = bus;
    }
}
