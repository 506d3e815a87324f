//! Per-device backend on top of rusb
//!
//! Transfers run on dedicated blocking threads, one per endpoint, so a long
//! poll on an interrupt endpoint never holds up control or bulk traffic. The
//! threads are fed through unbounded async-channel queues and report each
//! result through the request's completer.

use super::device::HostDevice;
use super::transfers;
use crate::usb::device::{DeviceBackend, Submission};
use crate::usb::lock;
use crate::usb::request::{RequestCompleter, RequestHandle};
use async_channel::{Receiver, Sender, TrySendError, unbounded};
use protocol::types::{REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE};
use protocol::{Setup, TransferStatus, Uid, UsbError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

type Inflight = Arc<Mutex<HashMap<RequestHandle, Arc<AtomicBool>>>>;

struct Job {
    handle: RequestHandle,
    submission: Submission,
    completer: RequestCompleter,
    cancelled: Arc<AtomicBool>,
}

struct EndpointWorker {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

pub(crate) struct RusbDeviceBackend {
    uid: Uid,
    host: Arc<HostDevice>,
    inflight: Inflight,
    workers: HashMap<u8, EndpointWorker>,
}

impl RusbDeviceBackend {
    pub fn new(host: HostDevice) -> Self {
        Self {
            uid: host.uid(),
            host: Arc::new(host),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            workers: HashMap::new(),
        }
    }

    fn worker_for(&mut self, endpoint: u8) -> std::io::Result<&EndpointWorker> {
        if !self.workers.contains_key(&endpoint) {
            let (jobs, rx) = unbounded();
            let host = self.host.clone();
            let inflight = self.inflight.clone();
            let thread = thread::Builder::new()
                .name(format!("usb-xfer-{}-{:02x}", self.uid, endpoint))
                .spawn(move || run_worker(host, endpoint, rx, inflight))?;
            self.workers.insert(endpoint, EndpointWorker { jobs, thread });
        }
        self.workers
            .get(&endpoint)
            .ok_or_else(|| std::io::Error::other("endpoint worker missing"))
    }
}

fn run_worker(host: Arc<HostDevice>, endpoint: u8, jobs: Receiver<Job>, inflight: Inflight) {
    debug!(
        "Transfer worker for device {} endpoint {:#04x} started",
        host.uid(),
        endpoint
    );

    while let Ok(job) = jobs.recv_blocking() {
        let outcome = transfers::execute(&host, &job.submission, &job.cancelled);
        job.completer
            .complete(outcome.status, outcome.data, outcome.actual_length);
        lock(&inflight).remove(&job.handle);
    }

    debug!(
        "Transfer worker for device {} endpoint {:#04x} stopped",
        host.uid(),
        endpoint
    );
}

impl DeviceBackend for RusbDeviceBackend {
    fn set_config(&mut self, configuration_value: u8) -> Result<(), UsbError> {
        self.host.set_configuration(configuration_value)
    }

    fn set_interface_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), UsbError> {
        self.host.set_alternate_setting(interface, alt_setting)
    }

    fn submit(&mut self, submission: Submission, completer: RequestCompleter) {
        let handle = completer.handle();
        let endpoint = submission.endpoint;
        let cancelled = Arc::new(AtomicBool::new(false));
        lock(&self.inflight).insert(handle, cancelled.clone());

        let job = Job {
            handle,
            submission,
            completer,
            cancelled,
        };

        let sent = match self.worker_for(endpoint) {
            Ok(worker) => worker.jobs.try_send(job),
            Err(e) => {
                error!(
                    "Failed to spawn transfer worker for device {} endpoint {:#04x}: {}",
                    self.uid, endpoint, e
                );
                lock(&self.inflight).remove(&handle);
                job.completer.complete(
                    TransferStatus::Failed(UsbError::Other {
                        message: e.to_string(),
                    }),
                    Vec::new(),
                    0,
                );
                return;
            }
        };

        if let Err(TrySendError::Closed(job) | TrySendError::Full(job)) = sent {
            warn!(
                "Transfer worker for device {} endpoint {:#04x} is gone",
                self.uid, endpoint
            );
            lock(&self.inflight).remove(&handle);
            job.completer
                .complete(TransferStatus::Failed(UsbError::NoDevice), Vec::new(), 0);
        }
    }

    fn cancel(&mut self, handle: RequestHandle) -> bool {
        match lock(&self.inflight).get(&handle) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn handle_locally(&mut self, setup: &Setup) -> Option<TransferStatus> {
        let result = if setup.is_standard_device() && setup.request == REQUEST_SET_CONFIGURATION {
            self.host.set_configuration(setup.value as u8)
        } else if setup.is_standard_interface() && setup.request == REQUEST_SET_INTERFACE {
            self.host
                .set_alternate_setting(setup.index as u8, setup.value as u8)
        } else {
            return None;
        };

        Some(match result {
            Ok(()) => TransferStatus::Completed,
            Err(e) => e.into_status(),
        })
    }

    fn release(&mut self) {
        for flag in lock(&self.inflight).values() {
            flag.store(true, Ordering::Release);
        }

        let current = thread::current().id();
        for (endpoint, worker) in self.workers.drain() {
            drop(worker.jobs);
            if worker.thread.thread().id() == current {
                // released from one of our own completions; the loop ends on its own
                continue;
            }
            if worker.thread.join().is_err() {
                error!(
                    "Transfer worker for device {} endpoint {:#04x} panicked",
                    self.uid, endpoint
                );
            }
        }

        self.host.close();
        debug!("Released host device {}", self.uid);
    }
}
