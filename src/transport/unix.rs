//! The unix I/O worker
//!
//! One thread owns the readiness loop for both endpoints and every armed timer. Endpoints are
//! watched through epoll by their raw descriptors; timers are one shot `timerfd`s registered
//! into the same epoll set, so timer callbacks run on the worker just like event dispatch
//! does.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::epoll;
use nix::unistd;

use crate::hci::acl::AclDataChannel;
use crate::hci::command_channel::CommandChannel;
use crate::hci::{EventPacket, HciAclData};
use crate::transport::{
    run_closed_callback, Error, HciEndpoint, SharedClosedCallback, TimerDriver, TimerHandle,
};

/// Epoll data values for the fixed members of the wait set; timers use everything above
const COMMAND_ENDPOINT_ID: u64 = 0;
const ACL_ENDPOINT_ID: u64 = 1;
const WAKE_ID: u64 = 2;
const FIRST_TIMER_ID: u64 = 3;

/// The largest frame either endpoint can hand us: an ACL header plus a full length payload
const READ_BUFFER_SIZE: usize = HciAclData::HEADER_SIZE + (u16::max_value() as usize);

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// An owned file descriptor, closed on drop
#[derive(Debug, PartialEq, Eq)]
struct FileDescriptor(RawFd);

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if let Err(e) = unistd::close(self.0) {
            log::warn!("failed to close file descriptor {}: {}", self.0, e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArcFileDesc(Arc<FileDescriptor>);

impl From<RawFd> for ArcFileDesc {
    fn from(rfd: RawFd) -> Self {
        ArcFileDesc(Arc::new(FileDescriptor(rfd)))
    }
}

impl ArcFileDesc {
    fn raw_fd(&self) -> RawFd {
        (*self.0).0
    }
}

fn make_timer_id(timer_fd: RawFd) -> u64 {
    // descriptors are unique while open, which is exactly as long as the id must be
    timer_fd as u64 + FIRST_TIMER_ID
}

struct TimerEntry {
    timer_fd: ArcFileDesc,
    callback: Box<dyn FnOnce() + Send>,
}

/// Timer driver backed by one shot `timerfd`s in the worker's epoll set
pub struct UnixTimerDriver {
    epoll_fd: ArcFileDesc,
    armed: Mutex<BTreeMap<u64, TimerEntry>>,
}

impl UnixTimerDriver {
    fn new(epoll_fd: ArcFileDesc) -> Self {
        UnixTimerDriver { epoll_fd, armed: Mutex::new(BTreeMap::new()) }
    }

    /// Run the callback of a fired timer
    fn fire(&self, id: u64) {
        let entry = {
            let mut armed = self.armed.lock().expect("timer map lock poisoned");

            armed.remove(&id)
        };

        if let Some(entry) = entry {
            let _ = epoll::epoll_ctl(
                self.epoll_fd.raw_fd(),
                epoll::EpollOp::EpollCtlDel,
                entry.timer_fd.raw_fd(),
                None,
            );

            // the callback runs with the timer map unlocked so it may arm new timers
            (entry.callback)();
        }
    }
}

impl TimerDriver for UnixTimerDriver {
    fn schedule(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<TimerHandle, Error> {
        let raw_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };

        if raw_fd < 0 {
            return Err(Error::from(nix::Error::Sys(Errno::last())));
        }

        let timer_fd = ArcFileDesc::from(raw_fd);

        let timeout_spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };

        if 0 > unsafe {
            libc::timerfd_settime(
                timer_fd.raw_fd(),
                0,
                &timeout_spec as *const libc::itimerspec,
                std::ptr::null_mut(),
            )
        } {
            return Err(Error::from(nix::Error::Sys(Errno::last())));
        }

        let id = make_timer_id(timer_fd.raw_fd());

        self.armed
            .lock()
            .expect("timer map lock poisoned")
            .insert(id, TimerEntry { timer_fd: timer_fd.clone(), callback });

        epoll::epoll_ctl(
            self.epoll_fd.raw_fd(),
            epoll::EpollOp::EpollCtlAdd,
            timer_fd.raw_fd(),
            &mut epoll::EpollEvent::new(epoll::EpollFlags::EPOLLIN, id),
        )
        .map_err(|e| {
            self.armed.lock().expect("timer map lock poisoned").remove(&id);
            Error::from(e)
        })?;

        Ok(TimerHandle(id))
    }

    fn cancel(&self, timer: TimerHandle) -> bool {
        let entry = self.armed.lock().expect("timer map lock poisoned").remove(&timer.0);

        match entry {
            Some(entry) => {
                let _ = epoll::epoll_ctl(
                    self.epoll_fd.raw_fd(),
                    epoll::EpollOp::EpollCtlDel,
                    entry.timer_fd.raw_fd(),
                    None,
                );
                true
            }
            None => false,
        }
    }
}

/// Builder so the timer driver exists before the channels it is given to
pub struct IoWorkerBuilder {
    epoll_fd: ArcFileDesc,
    wake_fd: ArcFileDesc,
    timers: Arc<UnixTimerDriver>,
}

impl IoWorkerBuilder {
    pub fn new() -> Result<Self, Error> {
        let epoll_fd = ArcFileDesc::from(epoll::epoll_create1(epoll::EpollCreateFlags::EPOLL_CLOEXEC)?);

        let wake_fd = ArcFileDesc::from(nix::sys::eventfd::eventfd(
            0,
            nix::sys::eventfd::EfdFlags::EFD_CLOEXEC | nix::sys::eventfd::EfdFlags::EFD_NONBLOCK,
        )?);

        epoll::epoll_ctl(
            epoll_fd.raw_fd(),
            epoll::EpollOp::EpollCtlAdd,
            wake_fd.raw_fd(),
            &mut epoll::EpollEvent::new(epoll::EpollFlags::EPOLLIN, WAKE_ID),
        )?;

        let timers = Arc::new(UnixTimerDriver::new(epoll_fd.clone()));

        Ok(IoWorkerBuilder { epoll_fd, wake_fd, timers })
    }

    pub fn get_timer_driver(&self) -> Arc<UnixTimerDriver> {
        self.timers.clone()
    }

    /// Register the endpoints and start the worker thread
    pub fn spawn<E>(
        self,
        command_endpoint: Arc<E>,
        acl_endpoint: Arc<E>,
        command_channel: Arc<CommandChannel>,
        acl_data_channel: Arc<AclDataChannel>,
        closed_callback: SharedClosedCallback,
    ) -> Result<IoWorker, Error>
    where
        E: HciEndpoint + AsRawFd + 'static,
    {
        let IoWorkerBuilder { epoll_fd, wake_fd, timers } = self;

        for (endpoint, id) in
            [(&command_endpoint, COMMAND_ENDPOINT_ID), (&acl_endpoint, ACL_ENDPOINT_ID)].iter()
        {
            epoll::epoll_ctl(
                epoll_fd.raw_fd(),
                epoll::EpollOp::EpollCtlAdd,
                endpoint.as_raw_fd(),
                &mut epoll::EpollEvent::new(epoll::EpollFlags::EPOLLIN, *id),
            )?;
        }

        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let running = running.clone();
            let wake_fd = wake_fd.clone();
            let timers = timers.clone();

            thread::Builder::new()
                .name("hci-io-worker".into())
                .spawn(move || {
                    let mut worker = WorkerState {
                        epoll_fd,
                        wake_fd,
                        timers,
                        command_endpoint,
                        acl_endpoint,
                        command_channel,
                        acl_data_channel,
                        closed_callback,
                        endpoints_open: true,
                        running,
                    };

                    worker.run();
                })
                .map_err(|e| Error::Io(e.to_string()))?
        };

        Ok(IoWorker { thread: Some(thread), wake_fd, running })
    }
}

/// Handle to the running worker thread
pub struct IoWorker {
    thread: Option<thread::JoinHandle<()>>,
    wake_fd: ArcFileDesc,
    running: Arc<AtomicBool>,
}

impl IoWorker {
    /// Stop and join the worker
    pub fn stop(mut self) {
        if let Some(thread) = self.thread.take() {
            self.running.store(false, Ordering::SeqCst);

            let _ = unistd::write(self.wake_fd.raw_fd(), &1u64.to_ne_bytes());

            if thread.join().is_err() {
                log::error!("HCI I/O worker panicked");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.running.store(false, Ordering::SeqCst);

            let _ = unistd::write(self.wake_fd.raw_fd(), &1u64.to_ne_bytes());
            let _ = thread.join();
        }
    }
}

struct WorkerState<E: HciEndpoint + AsRawFd> {
    epoll_fd: ArcFileDesc,
    wake_fd: ArcFileDesc,
    timers: Arc<UnixTimerDriver>,
    command_endpoint: Arc<E>,
    acl_endpoint: Arc<E>,
    command_channel: Arc<CommandChannel>,
    acl_data_channel: Arc<AclDataChannel>,
    closed_callback: SharedClosedCallback,
    endpoints_open: bool,
    running: Arc<AtomicBool>,
}

impl<E: HciEndpoint + AsRawFd> WorkerState<E> {
    fn run(&mut self) {
        log::info!("HCI I/O worker started");

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut events = [epoll::EpollEvent::empty(); 16];

        loop {
            let count = match epoll::epoll_wait(self.epoll_fd.raw_fd(), &mut events, -1) {
                Ok(count) => count,
                Err(nix::Error::Sys(Errno::EINTR)) => continue,
                Err(e) => {
                    log::error!("HCI I/O worker wait failed: {}", e);
                    self.on_peer_closed();
                    return;
                }
            };

            for event in events[..count].iter() {
                let closed = event
                    .events()
                    .intersects(epoll::EpollFlags::EPOLLHUP | epoll::EpollFlags::EPOLLERR);

                match event.data() {
                    WAKE_ID => {
                        let mut drain = [0u8; 8];
                        let _ = unistd::read(self.wake_fd.raw_fd(), &mut drain);

                        if !self.running.load(Ordering::SeqCst) {
                            log::info!("HCI I/O worker stopping");
                            return;
                        }
                    }
                    COMMAND_ENDPOINT_ID if closed => self.on_peer_closed(),
                    ACL_ENDPOINT_ID if closed => self.on_peer_closed(),
                    COMMAND_ENDPOINT_ID => self.drain_command_endpoint(&mut buffer),
                    ACL_ENDPOINT_ID => self.drain_acl_endpoint(&mut buffer),
                    timer_id => self.timers.fire(timer_id),
                }
            }
        }
    }

    fn drain_command_endpoint(&mut self, buffer: &mut [u8]) {
        loop {
            match self.command_endpoint.receive(buffer) {
                Ok(Some(size)) => match EventPacket::from_packet(&buffer[..size]) {
                    Ok(packet) => self.command_channel.receive_event_packet(&packet),
                    Err(e) => log::error!("dropping unframeable event packet: {}", e),
                },
                Ok(None) => return,
                Err(e) => {
                    log::error!("command endpoint read failed: {}", e);
                    self.on_peer_closed();
                    return;
                }
            }
        }
    }

    fn drain_acl_endpoint(&mut self, buffer: &mut [u8]) {
        loop {
            match self.acl_endpoint.receive(buffer) {
                Ok(Some(size)) => match HciAclData::from_packet(&buffer[..size]) {
                    Ok(packet) => self.acl_data_channel.receive_packet(packet),
                    Err(e) => log::error!("dropping unframeable ACL packet: {}", e),
                },
                Ok(None) => return,
                Err(e) => {
                    log::error!("ACL endpoint read failed: {}", e);
                    self.on_peer_closed();
                    return;
                }
            }
        }
    }

    /// The controller side of an endpoint is gone
    ///
    /// Both endpoint waits are cancelled, the channels stop accepting work, and the
    /// supervisor's closed callback runs once. Timers keep running until shutdown so that
    /// engine cancellations still fire.
    fn on_peer_closed(&mut self) {
        if !self.endpoints_open {
            return;
        }

        self.endpoints_open = false;

        log::error!("HCI endpoint closed by the controller side");

        for fd in [self.command_endpoint.as_raw_fd(), self.acl_endpoint.as_raw_fd()].iter() {
            let _ = epoll::epoll_ctl(self.epoll_fd.raw_fd(), epoll::EpollOp::EpollCtlDel, *fd, None);
        }

        self.acl_data_channel.shut_down();
        self.command_channel.shut_down();

        run_closed_callback(&self.closed_callback);
    }
}
