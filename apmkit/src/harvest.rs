//! Harvest scheduling
//!
//! Each application owns one dedicated ticker thread that drives the
//! periodic harvest cycle. The thread holds only a weak reference to the
//! application's shared state: an application whose handles were all dropped
//! can tear down without waiting out a tick.

use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::application::ApplicationInner;
use crate::error::HarvestError;
use crate::{apm_debug, apm_warn};

// TODO: surface the ack timeout in Config.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages exchanged between application handles and the ticker thread.
#[derive(Debug)]
enum TickerMessage {
    ForceHarvest(SyncSender<Result<(), HarvestError>>),
    Shutdown(SyncSender<Result<(), HarvestError>>),
}

/// Handle to one application's dedicated harvest thread.
#[derive(Debug)]
pub(crate) struct HarvestTicker {
    message_sender: SyncSender<TickerMessage>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HarvestTicker {
    /// Spawn the ticker thread for the named application.
    pub(crate) fn spawn(
        app_name: &str,
        interval: Duration,
        inner: Weak<ApplicationInner>,
    ) -> Self {
        let (message_sender, message_receiver) = sync_channel(4);

        let handle = thread::Builder::new()
            .name(format!("apmkit-harvest-{app_name}"))
            .spawn(move || loop {
                match message_receiver.recv_timeout(interval) {
                    Ok(TickerMessage::ForceHarvest(sender)) => {
                        let result = run_cycle(&inner);
                        let _ = sender.send(result);
                    }
                    Ok(TickerMessage::Shutdown(sender)) => {
                        // The final harvest already ran on the caller's
                        // thread, while the shared state was still
                        // reachable.
                        let _ = sender.send(Ok(()));
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = run_cycle(&inner) {
                            apm_warn!(name: "harvest_cycle_failed", error = format!("{err}"));
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        apm_debug!(name: "harvest_channel_disconnected");
                        break;
                    }
                }
            })
            .expect("Failed to spawn thread");

        HarvestTicker {
            message_sender,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Run one harvest cycle on the ticker thread and wait for it.
    pub(crate) fn force_harvest(&self) -> Result<(), HarvestError> {
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(TickerMessage::ForceHarvest(sender))
            .map_err(|_| HarvestError::Channel("Failed to send ForceHarvest message".into()))?;
        receiver.recv_timeout(ACK_TIMEOUT)?
    }

    /// Whether the caller is running on the ticker thread itself.
    pub(crate) fn is_current_thread(&self) -> bool {
        match self.handle.lock() {
            Ok(guard) => {
                guard.as_ref().map(|handle| handle.thread().id())
                    == Some(thread::current().id())
            }
            Err(_) => false,
        }
    }

    /// Stop the ticker thread and join it.
    pub(crate) fn stop(&self) -> Result<(), HarvestError> {
        let (sender, receiver) = sync_channel(1);
        self.message_sender
            .try_send(TickerMessage::Shutdown(sender))
            .map_err(|_| HarvestError::Channel("Failed to send Shutdown message".into()))?;
        let result = receiver.recv_timeout(ACK_TIMEOUT)?;
        if let Some(handle) = self.handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| HarvestError::Channel("harvest thread panicked".into()))?;
        }
        result
    }
}

fn run_cycle(inner: &Weak<ApplicationInner>) -> Result<(), HarvestError> {
    match inner.upgrade() {
        Some(inner) => inner.run_harvest(),
        // Every handle is gone; the application is tearing itself down.
        None => Ok(()),
    }
}
