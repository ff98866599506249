//! The command channel
//!
//! All host to controller commands go through here. The channel enforces the controller's
//! command flow control (the credit window reported in every command complete and command
//! status event), serializes conflicting submissions, matches completion events back to the
//! transaction that caused them, and fans every other event out to registered handlers.
//!
//! A submission sits in the channel's queue until all three of these hold:
//!
//! 1. the credit window is at least one,
//! 2. no in flight transaction uses the same opcode,
//! 3. no in flight transaction waits on the same asynchronous completion event (command
//!    complete and command status never conflict), and no in flight transaction has an
//!    opcode named in the submission's exclusion set.
//!
//! Rule 3 is also what makes asynchronous completion unambiguous: at most one transaction can
//! ever be waiting on a given completion event, so a matching event always belongs to it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::hci::events::{Events, EventsData, LEMeta};
use crate::hci::{CommandPacket, EventPacket};
use crate::transport::{HciEndpoint, TimerDriver, TimerHandle};

/// How long a sent command may go without a terminal event
///
/// Expiry is fatal to the channel; the controller has stopped holding up its end of the flow
/// control contract and upper layers are expected to tear the transport down.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifier of one command to completion conversation
pub type TransactionId = u64;

/// The transaction id returned when a command could not be enqueued
pub const INVALID_TRANSACTION_ID: TransactionId = 0;

/// Identifier of a registered event handler
pub type EventHandlerId = u64;

/// What an event handler wants done with its registration after an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventHandlerVerdict {
    Continue,
    Remove,
}

type CommandCallback = Box<dyn FnMut(TransactionId, &EventsData) + Send>;
type EventCallback = Box<dyn FnMut(&EventsData) -> EventHandlerVerdict + Send>;
type TimeoutCallback = Box<dyn FnMut() + Send>;

struct QueuedCommand {
    id: TransactionId,
    opcode: u16,
    completion_event: Events,
    exclusions: Vec<u16>,
    callback: Arc<Mutex<CommandCallback>>,
    packet: CommandPacket,
}

/// Bookkeeping for one in flight command
struct Transaction {
    id: TransactionId,
    completion_event: Events,
    callback: Arc<Mutex<CommandCallback>>,
    timeout: Option<TimerHandle>,
}

struct EventHandler {
    event: Events,
    internal: bool,
    callback: Arc<Mutex<EventCallback>>,
}

struct Inner {
    send_queue: VecDeque<QueuedCommand>,
    /// In flight transactions keyed by opcode; an opcode can only be in flight once
    pending: BTreeMap<u16, Transaction>,
    handlers: BTreeMap<EventHandlerId, EventHandler>,
    next_transaction_id: TransactionId,
    next_handler_id: EventHandlerId,
    /// Commands the controller can currently accept
    credits: usize,
    timeout_callback: Option<TimeoutCallback>,
    closed: bool,
}

/// Deferred callback work collected while the channel lock is held
enum Invocation {
    Transaction(TransactionId, Arc<Mutex<CommandCallback>>),
    Handler(EventHandlerId, Arc<Mutex<EventCallback>>),
}

pub struct CommandChannel {
    inner: Arc<Mutex<Inner>>,
    endpoint: Arc<dyn HciEndpoint>,
    timers: Arc<dyn TimerDriver>,
}

impl CommandChannel {
    pub fn new(endpoint: Arc<dyn HciEndpoint>, timers: Arc<dyn TimerDriver>) -> Self {
        CommandChannel {
            inner: Arc::new(Mutex::new(Inner {
                send_queue: VecDeque::new(),
                pending: BTreeMap::new(),
                handlers: BTreeMap::new(),
                next_transaction_id: 1,
                next_handler_id: 1,
                // one command until the controller reports its real budget
                credits: 1,
                timeout_callback: None,
                closed: false,
            })),
            endpoint,
            timers,
        }
    }

    /// Send a command completed by the command complete event
    ///
    /// The returned id is [`INVALID_TRANSACTION_ID`] when the channel is closed.
    pub fn send_command<C>(&self, packet: CommandPacket, callback: C) -> TransactionId
    where
        C: FnMut(TransactionId, &EventsData) + Send + 'static,
    {
        self.submit(packet, Box::new(callback), Events::CommandComplete, Vec::new())
    }

    /// Send a command whose terminal event is something other than command complete
    ///
    /// The callback sees every non terminal event for the transaction (a successful command
    /// status for an asynchronous command) and finally the terminal event.
    pub fn send_command_with_completion<C>(
        &self,
        packet: CommandPacket,
        callback: C,
        completion_event: Events,
    ) -> TransactionId
    where
        C: FnMut(TransactionId, &EventsData) + Send + 'static,
    {
        self.submit(packet, Box::new(callback), completion_event, Vec::new())
    }

    /// Send a command completed by a LE meta subevent
    pub fn send_le_async_command<C>(
        &self,
        packet: CommandPacket,
        callback: C,
        subevent: LEMeta,
    ) -> TransactionId
    where
        C: FnMut(TransactionId, &EventsData) + Send + 'static,
    {
        self.submit(packet, Box::new(callback), Events::LEMeta(subevent), Vec::new())
    }

    /// Send a command that must not run concurrently with the listed opcodes
    pub fn send_exclusive_command<C>(
        &self,
        packet: CommandPacket,
        callback: C,
        completion_event: Events,
        exclusions: Vec<u16>,
    ) -> TransactionId
    where
        C: FnMut(TransactionId, &EventsData) + Send + 'static,
    {
        self.submit(packet, Box::new(callback), completion_event, exclusions)
    }

    fn submit(
        &self,
        packet: CommandPacket,
        callback: CommandCallback,
        completion_event: Events,
        exclusions: Vec<u16>,
    ) -> TransactionId {
        let mut inner = self.lock();

        if inner.closed {
            log::warn!(
                "dropping command 0x{:04X} submitted to a closed command channel",
                packet.get_opcode()
            );
            return INVALID_TRANSACTION_ID;
        }

        let id = inner.next_transaction_id;
        inner.next_transaction_id += 1;

        inner.send_queue.push_back(QueuedCommand {
            id,
            opcode: packet.get_opcode(),
            completion_event,
            exclusions,
            callback: Arc::new(Mutex::new(callback)),
            packet,
        });

        self.dispatch_queued(&mut inner);

        id
    }

    /// Remove a command that has not been sent yet
    ///
    /// Returns false when the command was already sent (or never existed); a sent command can
    /// only end through its terminal event or the channel timeout.
    pub fn remove_queued(&self, id: TransactionId) -> bool {
        let mut inner = self.lock();

        match inner.send_queue.iter().position(|queued| queued.id == id) {
            Some(index) => {
                inner.send_queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Register a handler for an unsolicited event
    ///
    /// Multiple handlers may bind the same event, every one of them sees each occurrence.
    ///
    /// # Panics
    /// The event is one of the reserved codes the channel itself consumes.
    pub fn add_event_handler<C>(&self, event: Events, callback: C) -> EventHandlerId
    where
        C: FnMut(&EventsData) -> EventHandlerVerdict + Send + 'static,
    {
        assert!(!event.is_reserved(), "event {:?} is reserved for the transport", event);

        self.add_handler(event, Box::new(callback), false)
    }

    /// Register a handler for a LE meta subevent
    pub fn add_le_meta_event_handler<C>(&self, subevent: LEMeta, callback: C) -> EventHandlerId
    where
        C: FnMut(&EventsData) -> EventHandlerVerdict + Send + 'static,
    {
        self.add_handler(Events::LEMeta(subevent), Box::new(callback), false)
    }

    /// Register a transport internal handler, reserved codes allowed
    pub(crate) fn add_internal_event_handler<C>(&self, event: Events, callback: C) -> EventHandlerId
    where
        C: FnMut(&EventsData) -> EventHandlerVerdict + Send + 'static,
    {
        self.add_handler(event, Box::new(callback), true)
    }

    fn add_handler(&self, event: Events, callback: EventCallback, internal: bool) -> EventHandlerId {
        let mut inner = self.lock();

        let id = inner.next_handler_id;
        inner.next_handler_id += 1;

        inner.handlers.insert(
            id,
            EventHandler { event, internal, callback: Arc::new(Mutex::new(callback)) },
        );

        id
    }

    pub fn remove_event_handler(&self, id: EventHandlerId) {
        self.lock().handlers.remove(&id);
    }

    /// Set the callback run when a sent command times out
    ///
    /// Expiry marks the channel closed before the callback runs, so the callback observes a
    /// channel that refuses further submissions.
    pub fn set_channel_timeout_callback<C>(&self, callback: C)
    where
        C: FnMut() + Send + 'static,
    {
        self.lock().timeout_callback = Some(Box::new(callback));
    }

    /// Feed one framed event packet from the command endpoint
    ///
    /// Malformed events are logged and dropped here; nothing above ever sees them.
    pub fn receive_event_packet(&self, packet: &EventPacket) {
        match EventsData::try_from_packet(packet) {
            Ok(event) => self.process_event(&event),
            Err(reason) => {
                log::error!(
                    "dropping malformed event 0x{:02X}: {}",
                    packet.get_event_code(),
                    reason
                );
            }
        }
    }

    /// Dispatch one parsed event
    pub fn process_event(&self, event: &EventsData) {
        let invocations = match event {
            EventsData::CommandComplete(data) => self.handle_command_response(
                data.number_of_hci_command_packets,
                data.command_opcode,
                data.get_status(),
                true,
            ),
            EventsData::CommandStatus(data) => self.handle_command_response(
                data.number_of_hci_command_packets,
                data.command_opcode,
                Some(data.status),
                false,
            ),
            _ => self.handle_dispatched_event(event),
        };

        let mut remove_handlers = Vec::new();

        for invocation in invocations {
            match invocation {
                Invocation::Transaction(id, callback) => {
                    (callback.lock().expect("command callback lock poisoned"))(id, event);
                }
                Invocation::Handler(id, callback) => {
                    let verdict = (callback.lock().expect("event handler lock poisoned"))(event);

                    if verdict == EventHandlerVerdict::Remove {
                        remove_handlers.push(id);
                    }
                }
            }
        }

        // callbacks may have queued new commands, and completions may have freed credits
        let mut inner = self.lock();

        for id in remove_handlers {
            inner.handlers.remove(&id);
        }

        self.dispatch_queued(&mut inner);
    }

    /// Handle command complete and command status
    fn handle_command_response(
        &self,
        num_command_packets: u8,
        opcode: Option<u16>,
        status: Option<crate::hci::error::Error>,
        is_command_complete: bool,
    ) -> Vec<Invocation> {
        let mut invocations = Vec::new();

        let mut inner = self.lock();

        inner.credits = num_command_packets as usize;

        if let Some(opcode) = opcode {
            let terminal = match inner.pending.get(&opcode) {
                Some(transaction) => {
                    if is_command_complete {
                        // a command complete concludes the transaction unless it declared a
                        // different (asynchronous) completion event
                        transaction.completion_event == Events::CommandComplete
                    } else {
                        // an error status always concludes, a success status only concludes
                        // transactions that asked for command status
                        status.map(|s| !s.is_ok()).unwrap_or(false)
                            || transaction.completion_event == Events::CommandStatus
                    }
                }
                None => {
                    log::warn!("completion for opcode 0x{:04X} with no pending transaction", opcode);
                    false
                }
            };

            if terminal {
                if let Some(transaction) = inner.pending.remove(&opcode) {
                    if let Some(timer) = transaction.timeout {
                        self.timers.cancel(timer);
                    }

                    invocations.push(Invocation::Transaction(transaction.id, transaction.callback));
                }
            } else if let Some(transaction) = inner.pending.get(&opcode) {
                invocations
                    .push(Invocation::Transaction(transaction.id, transaction.callback.clone()));
            }
        }

        self.dispatch_queued(&mut inner);

        invocations
    }

    /// Handle everything that is not command complete or command status
    fn handle_dispatched_event(&self, event: &EventsData) -> Vec<Invocation> {
        let name = event.get_event_name();

        if let EventsData::HardwareError(ref data) = event {
            log::error!("controller reported hardware error 0x{:02X}", data.hardware_error);
        }

        let mut invocations = Vec::new();

        let mut inner = self.lock();

        // user handlers never see reserved events, transport internal ones may
        let deliverable_to_users = !name.is_reserved();

        for (&id, handler) in inner.handlers.iter() {
            if handler.event == name && (handler.internal || deliverable_to_users) {
                invocations.push(Invocation::Handler(id, handler.callback.clone()));
            }
        }

        // an asynchronous transaction waiting on this event as its completion concludes now;
        // submission rule 3 guarantees at most one such transaction exists
        let completed_opcode = inner
            .pending
            .iter()
            .find(|(_, transaction)| transaction.completion_event == name)
            .map(|(&opcode, _)| opcode);

        if let Some(opcode) = completed_opcode {
            if let Some(transaction) = inner.pending.remove(&opcode) {
                if let Some(timer) = transaction.timeout {
                    self.timers.cancel(timer);
                }

                invocations.push(Invocation::Transaction(transaction.id, transaction.callback));
            }
        }

        self.dispatch_queued(&mut inner);

        invocations
    }

    /// Send every eligible queued command
    ///
    /// Blocked submissions are skipped over, not waited behind, so an exclusion on one command
    /// never stalls an unrelated one. Relative order of commands sharing an opcode or a
    /// completion event is preserved because the earlier one becomes the blocker.
    fn dispatch_queued(&self, inner: &mut MutexGuard<Inner>) {
        if inner.closed {
            return;
        }

        let mut index = 0;

        while index < inner.send_queue.len() {
            if inner.credits == 0 {
                return;
            }

            if !Self::is_eligible(&inner.pending, &inner.send_queue[index]) {
                index += 1;
                continue;
            }

            let queued = match inner.send_queue.remove(index) {
                Some(queued) => queued,
                None => return,
            };

            let QueuedCommand { id, opcode, completion_event, callback, packet, .. } = queued;

            log::trace!("sending command 0x{:04X} (transaction {})", opcode, id);

            if let Err(e) = self.endpoint.send(&packet.into_packet()) {
                log::error!("failed to send command 0x{:04X}: {}", opcode, e);

                inner.closed = true;
                return;
            }

            inner.credits -= 1;

            let timeout = self.schedule_transaction_timeout(id);

            inner.pending.insert(opcode, Transaction { id, completion_event, callback, timeout });
        }
    }

    fn is_eligible(pending: &BTreeMap<u16, Transaction>, queued: &QueuedCommand) -> bool {
        if pending.contains_key(&queued.opcode) {
            return false;
        }

        // only asynchronous completion events conflict; every ordinary command finishes with
        // command complete and those run concurrently just fine
        let is_async = |event: Events| {
            event != Events::CommandComplete && event != Events::CommandStatus
        };

        pending.iter().all(|(&opcode, transaction)| {
            !(is_async(queued.completion_event)
                && transaction.completion_event == queued.completion_event)
                && !queued.exclusions.contains(&opcode)
        })
    }

    fn schedule_transaction_timeout(&self, id: TransactionId) -> Option<TimerHandle> {
        let inner = self.inner.clone();

        let result = self.timers.schedule(
            COMMAND_TIMEOUT,
            Box::new(move || {
                let mut timeout_callback = {
                    let mut inner = inner.lock().expect("command channel lock poisoned");

                    let still_pending =
                        inner.pending.values().any(|transaction| transaction.id == id);

                    if inner.closed || !still_pending {
                        return;
                    }

                    log::error!(
                        "command transaction {} timed out, the command channel is now closed",
                        id
                    );

                    inner.closed = true;

                    inner.timeout_callback.take()
                };

                if let Some(callback) = timeout_callback.as_mut() {
                    callback();
                }
            }),
        );

        match result {
            Ok(timer) => Some(timer),
            Err(e) => {
                log::error!("failed to arm command timeout: {}", e);
                None
            }
        }
    }

    /// Stop accepting submissions and drop everything queued
    pub fn shut_down(&self) {
        let mut inner = self.lock();

        inner.closed = true;
        inner.send_queue.clear();

        let timers: Vec<_> =
            inner.pending.values_mut().filter_map(|transaction| transaction.timeout.take()).collect();

        for timer in timers {
            self.timers.cancel(timer);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("command channel lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::opcodes::{ControllerAndBaseband, HCICommand};
    use crate::test_util::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel() -> (CommandChannel, Arc<FakeEndpoint>, Arc<FakeTimerDriver>) {
        let endpoint = FakeEndpoint::new();
        let timers = FakeTimerDriver::new();

        let channel =
            CommandChannel::new(endpoint.clone() as Arc<dyn HciEndpoint>, timers.clone() as _);

        (channel, endpoint, timers)
    }

    fn raw_command(opcode: u16) -> CommandPacket {
        CommandPacket::try_new_raw(opcode, Vec::new()).unwrap()
    }

    #[test]
    fn command_sent_and_completed() {
        let (channel, endpoint, timers) = channel();

        let completions = Arc::new(AtomicUsize::new(0));
        let completions_clone = completions.clone();

        let id = channel.send_command(
            CommandPacket::new(HCICommand::ControllerAndBaseband(ControllerAndBaseband::Reset), Vec::new()),
            move |_, event| {
                match event {
                    EventsData::CommandComplete(data) => {
                        assert!(data.get_status().unwrap().is_ok())
                    }
                    other => panic!("unexpected completion: {:?}", other),
                }
                completions_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_ne!(id, INVALID_TRANSACTION_ID);
        assert_eq!(endpoint.take_sent(), vec![Box::from(&[0x03, 0x0C, 0x00][..])]);
        assert_eq!(timers.armed_count(), 1);

        channel.receive_event_packet(&command_complete_frame(1, 0x0C03, 0x00));

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        // the transaction timeout is disarmed on completion
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn credit_window_gates_sending() {
        let (channel, endpoint, _timers) = channel();

        channel.send_command(raw_command(0xFC01), |_, _| ());

        // the single initial credit is consumed, the next command must wait
        channel.send_command(raw_command(0xFC02), |_, _| ());

        assert_eq!(endpoint.sent_count(), 1);

        // completion bumps the window and releases the queued command
        channel.receive_event_packet(&command_complete_frame(1, 0xFC01, 0x00));

        assert_eq!(endpoint.sent_count(), 2);
    }

    #[test]
    fn same_opcode_is_serialized() {
        let (channel, endpoint, _timers) = channel();

        channel.receive_event_packet(&command_complete_quota_frame(3));

        channel.send_command(raw_command(0xFC01), |_, _| ());
        channel.send_command(raw_command(0xFC01), |_, _| ());

        // plenty of credits, but the opcode is already in flight
        assert_eq!(endpoint.sent_count(), 1);

        channel.receive_event_packet(&command_complete_frame(3, 0xFC01, 0x00));

        assert_eq!(endpoint.sent_count(), 2);
    }

    #[test]
    fn blocked_command_does_not_stall_later_ones() {
        let (channel, endpoint, _timers) = channel();

        channel.receive_event_packet(&command_complete_quota_frame(3));

        channel.send_command(raw_command(0xFC01), |_, _| ());
        channel.send_command(raw_command(0xFC01), |_, _| ());
        channel.send_command(raw_command(0xFC02), |_, _| ());

        // the second 0xFC01 is blocked, 0xFC02 goes around it
        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..2], &[0x01, 0xFC]);
        assert_eq!(&sent[1][..2], &[0x02, 0xFC]);
    }

    #[test]
    fn exclusions_block_submission() {
        let (channel, endpoint, _timers) = channel();

        channel.receive_event_packet(&command_complete_quota_frame(3));

        channel.send_command(raw_command(0xFC01), |_, _| ());

        channel.send_exclusive_command(
            raw_command(0xFC02),
            |_, _| (),
            Events::CommandComplete,
            vec![0xFC01],
        );

        assert_eq!(endpoint.sent_count(), 1);

        channel.receive_event_packet(&command_complete_frame(3, 0xFC01, 0x00));

        assert_eq!(endpoint.sent_count(), 2);
    }

    #[test]
    fn async_command_completes_on_its_event() {
        let (channel, endpoint, _timers) = channel();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        channel.send_le_async_command(
            raw_command(0x200D),
            move |_, event| {
                match (seen_clone.fetch_add(1, Ordering::SeqCst), event) {
                    (0, EventsData::CommandStatus(data)) => assert!(data.status.is_ok()),
                    (1, EventsData::LEConnectionComplete(_)) => (),
                    other => panic!("unexpected callback sequence: {:?}", other),
                }
            },
            LEMeta::ConnectionComplete,
        );

        assert_eq!(endpoint.sent_count(), 1);

        // non terminal: successful command status for an async command
        channel.receive_event_packet(&command_status_frame(0x00, 1, 0x200D));

        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // opcode still in flight, a resubmission would be blocked
        channel.send_command(raw_command(0x200D), |_, _| panic!("must not complete"));

        assert_eq!(endpoint.sent_count(), 1);

        let complete = EventPacket::from_packet(&[
            0x3E, 19, 0x01, 0x00, 0x2A, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 0x18, 0x00, 0x00,
            0x00, 0x48, 0x00, 0x00,
        ])
        .unwrap();

        channel.receive_event_packet(&complete);

        assert_eq!(seen.load(Ordering::SeqCst), 2);

        // the async transaction ended, the queued duplicate opcode can now go out
        assert_eq!(endpoint.sent_count(), 2);
    }

    #[test]
    fn command_status_error_is_terminal() {
        let (channel, _endpoint, timers) = channel();

        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();

        channel.send_le_async_command(
            raw_command(0x200D),
            move |_, event| match event {
                EventsData::CommandStatus(data) => {
                    assert_eq!(data.status, crate::hci::error::Error::CommandDisallowed);
                    failures_clone.fetch_add(1, Ordering::SeqCst);
                }
                other => panic!("unexpected completion: {:?}", other),
            },
            LEMeta::ConnectionComplete,
        );

        channel.receive_event_packet(&command_status_frame(0x0C, 1, 0x200D));

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(timers.armed_count(), 0);
    }

    #[test]
    fn remove_queued_only_removes_unsent() {
        let (channel, endpoint, _timers) = channel();

        let sent_id = channel.send_command(raw_command(0xFC01), |_, _| ());

        let queued_id = channel.send_command(raw_command(0xFC02), |_, _| ());

        assert_eq!(endpoint.sent_count(), 1);

        assert!(!channel.remove_queued(sent_id));
        assert!(channel.remove_queued(queued_id));
        assert!(!channel.remove_queued(queued_id));

        // freeing the window must not send the removed command
        channel.receive_event_packet(&command_complete_frame(2, 0xFC01, 0x00));

        assert_eq!(endpoint.sent_count(), 1);
    }

    #[test]
    fn handlers_receive_matching_events() {
        let (channel, _endpoint, _timers) = channel();

        let reports = Arc::new(AtomicUsize::new(0));
        let reports_clone = reports.clone();

        let handler = channel.add_le_meta_event_handler(LEMeta::AdvertisingReport, move |event| {
            match event {
                EventsData::LEAdvertisingReport(_) => {
                    reports_clone.fetch_add(1, Ordering::SeqCst);
                }
                other => panic!("handler got wrong event: {:?}", other),
            }
            EventHandlerVerdict::Continue
        });

        let report = EventPacket::from_packet(&[
            0x3E, 12, 0x02, 1, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 0, 0x7F,
        ])
        .unwrap();

        channel.receive_event_packet(&report);
        channel.receive_event_packet(&report);

        assert_eq!(reports.load(Ordering::SeqCst), 2);

        channel.remove_event_handler(handler);

        channel.receive_event_packet(&report);

        assert_eq!(reports.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_verdict_remove_unregisters() {
        let (channel, _endpoint, _timers) = channel();

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations_clone = invocations.clone();

        channel.add_le_meta_event_handler(LEMeta::AdvertisingReport, move |_| {
            invocations_clone.fetch_add(1, Ordering::SeqCst);
            EventHandlerVerdict::Remove
        });

        let report = EventPacket::from_packet(&[
            0x3E, 12, 0x02, 1, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 0, 0x7F,
        ])
        .unwrap();

        channel.receive_event_packet(&report);
        channel.receive_event_packet(&report);

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic]
    fn reserved_event_handlers_are_rejected() {
        let (channel, _endpoint, _timers) = channel();

        channel.add_event_handler(Events::NumberOfCompletedPackets, |_| {
            EventHandlerVerdict::Continue
        });
    }

    #[test]
    fn transaction_timeout_closes_the_channel() {
        let (channel, endpoint, timers) = channel();

        let timed_out = Arc::new(AtomicUsize::new(0));
        let timed_out_clone = timed_out.clone();

        channel.set_channel_timeout_callback(move || {
            timed_out_clone.fetch_add(1, Ordering::SeqCst);
        });

        channel.send_command(raw_command(0xFC01), |_, _| panic!("must not complete"));

        timers.fire_all();

        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        assert!(channel.is_closed());

        // the dead channel refuses new work
        assert_eq!(channel.send_command(raw_command(0xFC02), |_, _| ()), INVALID_TRANSACTION_ID);
        assert_eq!(endpoint.sent_count(), 1);
    }

    #[test]
    fn malformed_event_is_dropped() {
        let (channel, endpoint, _timers) = channel();

        channel.send_command(raw_command(0xFC01), |_, _| ());

        // disconnection complete truncated to two parameter bytes
        channel.receive_event_packet(&EventPacket::from_packet(&[0x05, 2, 0x00, 0x01]).unwrap());

        // nothing changed: command still pending, channel alive
        assert!(!channel.is_closed());
        assert_eq!(endpoint.sent_count(), 1);
    }
}
