//! LE discovery
//!
//! The scanner drives the controller's scan state and post-processes advertising reports.
//! Under an active scan, a scannable advertisement is held back until its scan response
//! arrives (or a per-entry timeout gives up on it) so the delegate sees one result carrying
//! the combined payload instead of two halves.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::hci::cmds::le as le_cmds;
use crate::hci::command_channel::{CommandChannel, EventHandlerVerdict};
use crate::hci::common::{ScanInterval, ScanWindow};
use crate::hci::events::{AdvertisingEventType, EventsData, LEMeta};
use crate::hci::runner::{SequenceError, SequentialCommandRunner};
use crate::le::LocalAddressDelegate;
use crate::transport::{TimerDriver, TimerHandle};
use crate::BluetoothDeviceAddress;

pub use crate::hci::cmds::le::ScanningFilterPolicy;

/// What the scanner should do and for how long
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Active scans request scan responses, passive ones only listen
    pub active: bool,
    /// Let the controller suppress duplicate reports
    pub filter_duplicates: bool,
    pub filter_policy: ScanningFilterPolicy,
    /// How long to scan; `None` scans until stopped
    pub period: Option<Duration>,
    /// How long to hold a scannable advertisement while waiting for its scan response
    pub scan_response_timeout: Duration,
    pub interval: ScanInterval,
    pub window: ScanWindow,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            active: false,
            filter_duplicates: true,
            filter_policy: ScanningFilterPolicy::AcceptAll,
            period: None,
            scan_response_timeout: Duration::from_secs(2),
            interval: ScanInterval::default(),
            window: ScanWindow::default(),
        }
    }
}

/// One discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult {
    pub address: BluetoothDeviceAddress,
    /// The controller resolved the address against its resolving list
    pub resolved: bool,
    /// The peer accepts connection requests
    pub connectable: bool,
    pub rssi: i8,
}

/// Receiver of scan results
pub trait ScannerDelegate: Send {
    /// A peer was found; `data` is the advertising payload, with the scan response appended
    /// when one was coalesced
    fn on_peer_found(&mut self, result: ScanResult, data: &[u8]);

    /// A directed advertisement aimed at this host
    fn on_directed_advertisement(&mut self, result: ScanResult);
}

/// Progress reports of one scan
#[derive(Debug, Clone, PartialEq)]
pub enum ScanStatus {
    /// The controller is actively scanning and requesting scan responses
    Active,
    /// The controller is listening without requesting anything
    Passive,
    /// The scan ended because the caller stopped it
    Stopped,
    /// The scan period elapsed
    Complete,
    /// The controller rejected the scan setup
    Failed(SequenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Initiating,
    ActiveScanning,
    PassiveScanning,
    Stopping,
}

type StatusCallback = Box<dyn FnMut(ScanStatus) + Send>;

struct PendingScanResult {
    result: ScanResult,
    data: Vec<u8>,
    timer: Option<TimerHandle>,
}

enum Emission {
    Peer(ScanResult, Vec<u8>),
    Directed(ScanResult),
}

struct Inner {
    state: ScannerState,
    options: ScanOptions,
    pending_results: BTreeMap<BluetoothDeviceAddress, PendingScanResult>,
    period_timer: Option<TimerHandle>,
    status_callback: Option<StatusCallback>,
    delegate: Option<Box<dyn ScannerDelegate>>,
    /// Distinguishes the current scan from stale timers of older ones
    scan_counter: u64,
}

/// Driver of LE scanning
///
/// Cloning is shallow; clones share the one scan state machine.
#[derive(Clone)]
pub struct LowEnergyScanner {
    inner: Arc<Mutex<Inner>>,
    runner: SequentialCommandRunner,
    timers: Arc<dyn TimerDriver>,
    address_delegate: Arc<dyn LocalAddressDelegate>,
}

impl LowEnergyScanner {
    pub fn new(
        channel: Arc<CommandChannel>,
        timers: Arc<dyn TimerDriver>,
        address_delegate: Arc<dyn LocalAddressDelegate>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            state: ScannerState::Idle,
            options: ScanOptions::default(),
            pending_results: BTreeMap::new(),
            period_timer: None,
            status_callback: None,
            delegate: None,
            scan_counter: 0,
        }));

        let runner = SequentialCommandRunner::new(channel.clone());

        let scanner = LowEnergyScanner {
            inner: inner.clone(),
            runner,
            timers: timers.clone(),
            address_delegate,
        };

        {
            let scanner = scanner.clone();

            channel.add_le_meta_event_handler(LEMeta::AdvertisingReport, move |event| {
                if let EventsData::LEAdvertisingReport(ref data) = event {
                    scanner.on_advertising_reports(data);
                }

                EventHandlerVerdict::Continue
            });
        }

        scanner
    }

    /// Install the delegate that receives scan results
    pub fn set_delegate<D>(&self, delegate: D)
    where
        D: ScannerDelegate + 'static,
    {
        self.lock().delegate = Some(Box::new(delegate));
    }

    /// Start scanning
    ///
    /// Returns false when a scan is already running (or starting, or stopping). The status
    /// callback first reports the running state and later how the scan ended.
    pub fn start_scan<C>(&self, options: ScanOptions, status_callback: C) -> bool
    where
        C: FnMut(ScanStatus) + Send + 'static,
    {
        let scan_counter = {
            let mut inner = self.lock();

            if inner.state != ScannerState::Idle {
                log::warn!("scan refused, the scanner is not idle");
                return false;
            }

            inner.state = ScannerState::Initiating;
            inner.scan_counter += 1;
            inner.options = options;
            inner.status_callback = Some(Box::new(status_callback));

            inner.scan_counter
        };

        let scanner = self.clone();

        self.address_delegate.ensure_local_address(Box::new(move |local_address| {
            let (active, setup) = {
                let inner = scanner.lock();

                if inner.scan_counter != scan_counter {
                    return;
                }

                let options = &inner.options;

                let scan_type = if options.active {
                    le_cmds::ScanType::Active
                } else {
                    le_cmds::ScanType::Passive
                };

                (
                    options.active,
                    (
                        le_cmds::set_scan_parameters(
                            scan_type,
                            options.interval,
                            options.window,
                            local_address.own_address_type(),
                            options.filter_policy,
                        ),
                        le_cmds::set_scan_enable(true, options.filter_duplicates),
                    ),
                )
            };

            let (parameters, enable) = setup;

            scanner.runner.queue_command(parameters, |_| (), true);
            scanner.runner.queue_command(enable, |_| (), true);

            let on_result = scanner.clone();

            scanner.runner.run_commands(move |result| {
                on_result.on_scan_started(scan_counter, active, result);
            });
        }));

        true
    }

    /// Stop a running scan
    ///
    /// Pending scan response coalescing entries are discarded, a user initiated stop is not
    /// interested in half-collected results.
    pub fn stop_scan(&self) -> bool {
        self.stop(false)
    }

    pub fn get_state(&self) -> ScannerState {
        self.lock().state
    }

    fn stop(&self, period_elapsed: bool) -> bool {
        let flushed = {
            let mut inner = self.lock();

            match inner.state {
                ScannerState::ActiveScanning | ScannerState::PassiveScanning => (),
                _ => {
                    log::warn!("stop requested but the scanner is not scanning");
                    return false;
                }
            }

            inner.state = ScannerState::Stopping;

            if let Some(timer) = inner.period_timer.take() {
                self.timers.cancel(timer);
            }

            let entries = std::mem::replace(&mut inner.pending_results, BTreeMap::new());

            let mut flushed = Vec::new();

            for (_, mut entry) in entries {
                if let Some(timer) = entry.timer.take() {
                    self.timers.cancel(timer);
                }

                // results collected so far survive a natural period end but not a user stop
                if period_elapsed {
                    flushed.push(Emission::Peer(entry.result, entry.data));
                }
            }

            flushed
        };

        self.deliver(flushed);

        let scanner = self.clone();

        self.runner.queue_command(le_cmds::set_scan_enable(false, false), |_| (), true);

        self.runner.run_commands(move |result| {
            if let Err(e) = result {
                log::error!("scan disable failed: {}", e);
            }

            let callback = {
                let mut inner = scanner.lock();

                inner.state = ScannerState::Idle;

                inner.status_callback.take()
            };

            if let Some(mut callback) = callback {
                callback(if period_elapsed { ScanStatus::Complete } else { ScanStatus::Stopped });
            }
        });

        true
    }

    /// The scan setup sequence finished
    fn on_scan_started(&self, scan_counter: u64, active: bool, result: Result<(), SequenceError>) {
        let (callback, status) = {
            let mut inner = self.lock();

            if inner.scan_counter != scan_counter || inner.state != ScannerState::Initiating {
                return;
            }

            match result {
                Ok(()) => {
                    inner.state = if active {
                        ScannerState::ActiveScanning
                    } else {
                        ScannerState::PassiveScanning
                    };

                    if let Some(period) = inner.options.period {
                        let scanner = self.clone();

                        match self.timers.schedule(
                            period,
                            Box::new(move || {
                                scanner.on_period_end(scan_counter);
                            }),
                        ) {
                            Ok(timer) => inner.period_timer = Some(timer),
                            Err(e) => log::error!("failed to arm the scan period timer: {}", e),
                        }
                    }

                    let status =
                        if active { ScanStatus::Active } else { ScanStatus::Passive };

                    (inner.status_callback.take(), status)
                }
                Err(e) => {
                    inner.state = ScannerState::Idle;

                    (inner.status_callback.take(), ScanStatus::Failed(e))
                }
            }
        };

        if let Some(mut callback) = callback {
            let ended = if let ScanStatus::Failed(_) = status { true } else { false };

            callback(status);

            // a running scan keeps its callback for the eventual stop report
            if !ended {
                let mut inner = self.lock();

                if inner.scan_counter == scan_counter && inner.status_callback.is_none() {
                    inner.status_callback = Some(callback);
                }
            }
        }
    }

    fn on_period_end(&self, scan_counter: u64) {
        if self.lock().scan_counter != scan_counter {
            return;
        }

        self.stop(true);
    }

    /// Post-process one advertising report event
    fn on_advertising_reports(&self, data: &crate::hci::events::LEAdvertisingReportData) {
        let emissions = {
            let mut inner = self.lock();

            let active = match inner.state {
                ScannerState::ActiveScanning => true,
                ScannerState::PassiveScanning => false,
                // reports can trail the disable, nothing is listening anymore
                _ => return,
            };

            let scan_counter = inner.scan_counter;

            let mut emissions = Vec::new();

            for report in data.reports.iter() {
                let result = ScanResult {
                    address: report.address,
                    resolved: report.address_type.is_resolved(),
                    connectable: report.event_type.is_connectable(),
                    rssi: report.rssi,
                };

                match report.event_type {
                    AdvertisingEventType::ConnectableDirected => {
                        emissions.push(Emission::Directed(result));
                    }
                    AdvertisingEventType::ScanResponse => {
                        // a response only means something when its advertisement is waiting
                        if let Some(mut entry) = inner.pending_results.remove(&report.address) {
                            if let Some(timer) = entry.timer.take() {
                                self.timers.cancel(timer);
                            }

                            entry.data.extend_from_slice(&report.data);
                            entry.result.rssi = report.rssi;
                            entry.result.resolved = result.resolved;

                            emissions.push(Emission::Peer(entry.result, entry.data));
                        } else {
                            log::trace!("dropping unmatched scan response");
                        }
                    }
                    _ if active && report.event_type.is_scannable() => {
                        let timer = {
                            let scanner = self.clone();
                            let address = report.address;

                            self.timers
                                .schedule(
                                    inner.options.scan_response_timeout,
                                    Box::new(move || {
                                        scanner.on_scan_response_timeout(scan_counter, address);
                                    }),
                                )
                                .map_err(|e| {
                                    log::error!("failed to arm scan response timeout: {}", e)
                                })
                                .ok()
                        };

                        // a repeated advertisement restarts the coalescing window
                        if let Some(previous) = inner.pending_results.insert(
                            report.address,
                            PendingScanResult { result, data: report.data.clone(), timer },
                        ) {
                            if let Some(timer) = previous.timer {
                                self.timers.cancel(timer);
                            }
                        }
                    }
                    _ => {
                        emissions.push(Emission::Peer(result, report.data.clone()));
                    }
                }
            }

            emissions
        };

        self.deliver(emissions);
    }

    /// No scan response arrived in time, report the advertisement alone
    fn on_scan_response_timeout(&self, scan_counter: u64, address: BluetoothDeviceAddress) {
        let emission = {
            let mut inner = self.lock();

            if inner.scan_counter != scan_counter {
                return;
            }

            inner.pending_results.remove(&address).map(|mut entry| {
                entry.timer = None;

                Emission::Peer(entry.result, entry.data)
            })
        };

        if let Some(emission) = emission {
            self.deliver(vec![emission]);
        }
    }

    /// Run delegate callbacks with the scanner unlocked
    fn deliver(&self, emissions: Vec<Emission>) {
        if emissions.is_empty() {
            return;
        }

        let delegate = self.lock().delegate.take();

        let mut delegate = match delegate {
            Some(delegate) => delegate,
            None => {
                log::warn!("dropping {} scan results, no delegate registered", emissions.len());
                return;
            }
        };

        for emission in emissions {
            match emission {
                Emission::Peer(result, data) => delegate.on_peer_found(result, &data),
                Emission::Directed(result) => delegate.on_directed_advertisement(result),
            }
        }

        let mut inner = self.lock();

        if inner.delegate.is_none() {
            inner.delegate = Some(delegate);
        }
    }

    fn lock(&self) -> MutexGuard<Inner> {
        self.inner.lock().expect("scanner lock poisoned")
    }
}
