//! Ordered command chains
//!
//! The runner strings commands into a sequence with opt-in parallelism. Commands queued with
//! `wait` set open a new batch, commands queued without it join the batch in front of them;
//! every command of a batch is handed to the command channel at once, and the next batch only
//! starts when the whole current batch has completed successfully. The first failure aborts
//! the remainder of the sequence.
//!
//! Each run is stamped with a sequence number. Completions that arrive after a cancel (or
//! after a restart from inside a callback) carry a stale number and fall on the floor, so a
//! new sequence never inherits state from the old one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::hci::command_channel::{CommandChannel, TransactionId, INVALID_TRANSACTION_ID};
use crate::hci::error;
use crate::hci::events::{Events, EventsData, LEMeta};
use crate::hci::CommandPacket;

/// Why a command sequence ended without finishing
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceError {
    /// A command completed with a controller error status
    Controller(error::Error),
    /// The sequence was cancelled
    Canceled,
    /// The command channel refused a submission (it is closed)
    SubmitFailed,
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SequenceError::Controller(status) => write!(f, "command failed: {}", status),
            SequenceError::Canceled => write!(f, "sequence cancelled"),
            SequenceError::SubmitFailed => write!(f, "command channel rejected a submission"),
        }
    }
}

pub type SequenceResult = Result<(), SequenceError>;

type PerCommandCallback = Box<dyn FnMut(&EventsData) + Send>;
type ResultCallback = Box<dyn FnOnce(SequenceResult) + Send>;

struct QueuedSequenceCommand {
    packet: CommandPacket,
    callback: Option<PerCommandCallback>,
    wait: bool,
    completion_event: Events,
    exclusions: Vec<u16>,
}

struct Inner {
    queue: VecDeque<QueuedSequenceCommand>,
    sequence_number: u64,
    outstanding: usize,
    /// The running sequence hit a failure; stragglers still report but nothing advances
    failed: bool,
    result_callback: Option<ResultCallback>,
    /// A finished failure result waiting to be delivered outside the lock
    pending_result: Option<(ResultCallback, SequenceResult)>,
}

/// Runs queued commands in order, a batch at a time
///
/// Cloning is shallow; clones drive the same sequence.
#[derive(Clone)]
pub struct SequentialCommandRunner {
    inner: Arc<Mutex<Inner>>,
    channel: Arc<CommandChannel>,
}

impl SequentialCommandRunner {
    pub fn new(channel: Arc<CommandChannel>) -> Self {
        SequentialCommandRunner {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                sequence_number: 0,
                outstanding: 0,
                failed: false,
                result_callback: None,
                pending_result: None,
            })),
            channel,
        }
    }

    /// Queue a command completed by command complete
    ///
    /// With `wait` set the command starts a new batch: it will not be dispatched until every
    /// earlier command in the sequence has completed successfully. Without it the command
    /// joins the batch in front of it. The first command of a sequence always starts
    /// immediately either way.
    pub fn queue_command<C>(&self, packet: CommandPacket, callback: C, wait: bool)
    where
        C: FnMut(&EventsData) + Send + 'static,
    {
        self.queue(packet, Some(Box::new(callback)), wait, Events::CommandComplete, Vec::new());
    }

    /// Queue a command with an explicit completion event and exclusion set
    pub fn queue_command_with_completion<C>(
        &self,
        packet: CommandPacket,
        callback: C,
        wait: bool,
        completion_event: Events,
        exclusions: Vec<u16>,
    ) where
        C: FnMut(&EventsData) + Send + 'static,
    {
        self.queue(packet, Some(Box::new(callback)), wait, completion_event, exclusions);
    }

    /// Queue a command completed by a LE meta subevent
    pub fn queue_le_async_command<C>(
        &self,
        packet: CommandPacket,
        subevent: LEMeta,
        callback: C,
        wait: bool,
    ) where
        C: FnMut(&EventsData) + Send + 'static,
    {
        self.queue(packet, Some(Box::new(callback)), wait, Events::LEMeta(subevent), Vec::new());
    }

    fn queue(
        &self,
        packet: CommandPacket,
        callback: Option<PerCommandCallback>,
        wait: bool,
        completion_event: Events,
        exclusions: Vec<u16>,
    ) {
        self.lock().queue.push_back(QueuedSequenceCommand {
            packet,
            callback,
            wait,
            completion_event,
            exclusions,
        });
    }

    /// Start running the queued sequence
    ///
    /// The result callback fires exactly once: with `Ok` after the last queued command
    /// completes successfully, or with the first failure.
    ///
    /// # Panics
    /// A sequence is already running; check [`is_ready`](SequentialCommandRunner::is_ready).
    pub fn run_commands<C>(&self, result_callback: C)
    where
        C: FnOnce(SequenceResult) + Send + 'static,
    {
        let finished = {
            let mut inner = self.lock();

            assert!(
                inner.result_callback.is_none() && inner.outstanding == 0,
                "run_commands called while a sequence is running"
            );

            inner.sequence_number += 1;
            inner.failed = false;
            inner.result_callback = Some(Box::new(result_callback));

            self.start_next_batch(&mut inner);

            self.take_finished(&mut inner)
        };

        deliver(finished);
    }

    /// Abort the sequence
    ///
    /// Outstanding commands keep running at the channel but their completions no longer
    /// advance anything here. Safe to call at any time, from any thread, including from a
    /// per-command callback; calling it twice is a no-op.
    pub fn cancel(&self) {
        let callback = {
            let mut inner = self.lock();

            inner.sequence_number += 1;
            inner.failed = false;
            inner.queue.clear();
            inner.outstanding = 0;

            inner.result_callback.take()
        };

        if let Some(callback) = callback {
            callback(Err(SequenceError::Canceled));
        }
    }

    /// Check if a new sequence may be started
    pub fn is_ready(&self) -> bool {
        let inner = self.lock();

        inner.result_callback.is_none() && inner.outstanding == 0
    }

    pub fn has_queued_commands(&self) -> bool {
        !self.lock().queue.is_empty()
    }

    /// Hand the front batch to the command channel
    fn start_next_batch(&self, inner: &mut MutexGuard<Inner>) {
        let sequence_number = inner.sequence_number;

        let mut first = true;

        loop {
            match inner.queue.front() {
                Some(front) if first || !front.wait => (),
                _ => break,
            }

            first = false;

            let command = match inner.queue.pop_front() {
                Some(command) => command,
                None => break,
            };

            inner.outstanding += 1;

            let QueuedSequenceCommand { packet, mut callback, completion_event, exclusions, .. } =
                command;

            let runner = self.clone();

            let id = self.channel.send_exclusive_command(
                packet,
                move |_: TransactionId, event: &EventsData| {
                    runner.on_command_event(sequence_number, event, completion_event, &mut callback);
                },
                completion_event,
                exclusions,
            );

            if id == INVALID_TRANSACTION_ID {
                self.fail(inner, SequenceError::SubmitFailed);
                return;
            }
        }
    }

    /// A completion event for one of this runner's commands
    fn on_command_event(
        &self,
        sequence_number: u64,
        event: &EventsData,
        completion_event: Events,
        callback: &mut Option<PerCommandCallback>,
    ) {
        let failure = match event {
            EventsData::CommandComplete(data) => {
                data.get_status().and_then(|status| if status.is_ok() { None } else { Some(status) })
            }
            EventsData::CommandStatus(data) => {
                if data.status.is_ok() {
                    None
                } else {
                    Some(data.status)
                }
            }
            _ => None,
        };

        if failure.is_none() && event.get_event_name() != completion_event {
            // non terminal, e.g. a successful command status for an asynchronous command
            return;
        }

        if self.lock().sequence_number != sequence_number {
            log::trace!("dropping completion for a cancelled command sequence");
            return;
        }

        // the per-command callback sees the terminal event either way, and runs unlocked so
        // it may cancel or requeue
        if let Some(callback) = callback.as_mut() {
            callback(event);
        }

        let finished = {
            let mut inner = self.lock();

            if inner.sequence_number != sequence_number {
                // the callback restarted the sequence
                return;
            }

            if let Some(status) = failure {
                if inner.failed {
                    return;
                }

                self.fail(&mut inner, SequenceError::Controller(status));
            } else {
                if inner.failed {
                    // a sibling of the batch already failed, this success must not advance
                    return;
                }

                inner.outstanding -= 1;

                if inner.outstanding == 0 && !inner.queue.is_empty() {
                    self.start_next_batch(&mut inner);
                }
            }

            self.take_finished(&mut inner)
        };

        deliver(finished);
    }

    /// Mark the running sequence failed and drop what has not been dispatched
    ///
    /// The sequence number is kept, so stragglers of the failed run still get recognized
    /// (their callbacks already ran at the channel, they just must not advance anything).
    fn fail(&self, inner: &mut MutexGuard<Inner>, error: SequenceError) {
        inner.queue.clear();
        inner.outstanding = 0;
        inner.failed = true;

        if let Some(callback) = inner.result_callback.take() {
            inner.pending_result = Some((callback, Err(error)));
        }
    }

    /// Take the result callback once the sequence has nothing left to do
    fn take_finished(
        &self,
        inner: &mut MutexGuard<Inner>,
    ) -> Option<(ResultCallback, SequenceResult)> {
        if let Some(finished) = inner.pending_result.take() {
            return Some(finished);
        }

        if inner.result_callback.is_some() && inner.outstanding == 0 && inner.queue.is_empty() {
            inner.result_callback.take().map(|callback| (callback, Ok(())))
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("sequential command runner lock poisoned")
    }
}

fn deliver(finished: Option<(ResultCallback, SequenceResult)>) {
    if let Some((callback, result)) = finished {
        callback(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner(credits: u8) -> (SequentialCommandRunner, Arc<CommandChannel>, Arc<FakeEndpoint>) {
        let endpoint = FakeEndpoint::new();
        let timers = FakeTimerDriver::new();

        let channel = Arc::new(CommandChannel::new(
            endpoint.clone() as Arc<dyn crate::transport::HciEndpoint>,
            timers as Arc<dyn crate::transport::TimerDriver>,
        ));

        channel.receive_event_packet(&command_complete_quota_frame(credits));

        (SequentialCommandRunner::new(channel.clone()), channel, endpoint)
    }

    fn raw_command(opcode: u16) -> CommandPacket {
        CommandPacket::try_new_raw(opcode, Vec::new()).unwrap()
    }

    #[test]
    fn serial_commands_all_succeed() {
        let (runner, channel, endpoint) = runner(5);

        let command_completions = Arc::new(AtomicUsize::new(0));
        let results = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let completions = command_completions.clone();

            runner.queue_command(
                raw_command(0xFFFF),
                move |_| {
                    completions.fetch_add(1, Ordering::SeqCst);
                },
                true,
            );
        }

        let results_clone = results.clone();

        runner.run_commands(move |result| {
            assert_eq!(result, Ok(()));
            results_clone.fetch_add(1, Ordering::SeqCst);
        });

        // only the first batch is on the wire
        let sent = endpoint.take_sent();

        assert_eq!(sent, vec![Box::from(&[0xFF, 0xFF, 0x00][..])]);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        assert_eq!(endpoint.take_sent(), vec![Box::from(&[0xFF, 0xFF, 0x00][..])]);
        assert_eq!(results.load(Ordering::SeqCst), 0);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        assert_eq!(command_completions.load(Ordering::SeqCst), 2);
        assert_eq!(results.load(Ordering::SeqCst), 1);
        assert!(runner.is_ready());
    }

    #[test]
    fn failure_short_circuits() {
        let (runner, channel, endpoint) = runner(5);

        let first_callback = Arc::new(AtomicUsize::new(0));
        let first_callback_clone = first_callback.clone();

        runner.queue_command(
            raw_command(0xFFFF),
            move |event| {
                // the per-command callback still sees the failing completion
                match event {
                    EventsData::CommandComplete(data) => assert_eq!(
                        data.get_status(),
                        Some(crate::hci::error::Error::AuthenticationFailure)
                    ),
                    other => panic!("unexpected terminal event: {:?}", other),
                }
                first_callback_clone.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        runner.queue_command(raw_command(0xFFFF), |_| panic!("second command must not run"), true);

        let results = Arc::new(AtomicUsize::new(0));
        let results_clone = results.clone();

        runner.run_commands(move |result| {
            assert_eq!(
                result,
                Err(SequenceError::Controller(crate::hci::error::Error::AuthenticationFailure))
            );
            results_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(endpoint.take_sent().len(), 1);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x05));

        assert_eq!(first_callback.load(Ordering::SeqCst), 1);
        assert_eq!(results.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.sent_count(), 0);
        assert!(runner.is_ready());
    }

    #[test]
    fn parallel_batch_then_serial() {
        let (runner, channel, endpoint) = runner(5);

        runner.queue_command(raw_command(0xFFFF), |_| (), true);
        runner.queue_command(raw_command(0xF00F), |_| (), false);
        runner.queue_command(raw_command(0xFFFF), |_| (), true);

        let results = Arc::new(AtomicUsize::new(0));
        let results_clone = results.clone();

        runner.run_commands(move |result| {
            assert_eq!(result, Ok(()));
            results_clone.fetch_add(1, Ordering::SeqCst);
        });

        // the first two run as one batch, the third waits
        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..2], &[0xFF, 0xFF]);
        assert_eq!(&sent[1][..2], &[0x0F, 0xF0]);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        // one of the two is still outstanding
        assert_eq!(endpoint.sent_count(), 0);

        channel.receive_event_packet(&command_complete_frame(5, 0xF00F, 0x00));

        assert_eq!(endpoint.take_sent().len(), 1);
        assert_eq!(results.load(Ordering::SeqCst), 0);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        assert_eq!(results.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (runner, _channel, endpoint) = runner(5);

        runner.queue_command(raw_command(0xFFFF), |_| (), true);
        runner.queue_command(raw_command(0xFFFF), |_| (), true);

        let results = Arc::new(AtomicUsize::new(0));
        let results_clone = results.clone();

        runner.run_commands(move |result| {
            assert_eq!(result, Err(SequenceError::Canceled));
            results_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(endpoint.take_sent().len(), 1);

        runner.cancel();
        runner.cancel();

        assert_eq!(results.load(Ordering::SeqCst), 1);
        assert!(runner.is_ready());
        assert!(!runner.has_queued_commands());
    }

    #[test]
    fn stale_completion_after_cancel_is_ignored() {
        let (runner, channel, endpoint) = runner(5);

        runner.queue_command(raw_command(0xFFFF), |_| panic!("stale callback ran"), true);

        runner.run_commands(|_| ());

        assert_eq!(endpoint.take_sent().len(), 1);

        runner.cancel();

        // the completion of the already dispatched command arrives after the cancel
        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        assert!(runner.is_ready());
    }

    #[test]
    fn requeue_from_callback() {
        let (runner, channel, endpoint) = runner(5);

        let runner_clone = runner.clone();

        runner.queue_command(
            raw_command(0xFFFF),
            move |_| {
                runner_clone.cancel();
                runner_clone.queue_command(raw_command(0xF00F), |_| (), true);
                runner_clone.run_commands(|result| assert_eq!(result, Ok(())));
            },
            true,
        );

        let first_result = Arc::new(AtomicUsize::new(0));
        let first_result_clone = first_result.clone();

        runner.run_commands(move |result| {
            assert_eq!(result, Err(SequenceError::Canceled));
            first_result_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(endpoint.take_sent().len(), 1);

        channel.receive_event_packet(&command_complete_frame(5, 0xFFFF, 0x00));

        // the callback cancelled the first run and started a second one
        assert_eq!(first_result.load(Ordering::SeqCst), 1);

        let sent = endpoint.take_sent();

        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..2], &[0x0F, 0xF0]);

        channel.receive_event_packet(&command_complete_frame(5, 0xF00F, 0x00));

        assert!(runner.is_ready());
    }
}
