//! Gadget lifecycle: driver registration and the streaming thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::config::GadgetConfig;
use crate::control::ControlStateMachine;
use crate::convert::{PixelConverter, SoftwareConverter};
use crate::display::Display;
use crate::driver::{ClassDriver, DriverDescriptors, UdcDriverManager, UvcClassDriver};
use crate::error::{GadgetError, GadgetResult};
use crate::session::Session;
use crate::stats::StatsSnapshot;
use crate::streaming::StreamingLoop;
use crate::transport::UsbDeviceController;

/// Name of the streaming thread.
pub const STREAMING_THREAD_NAME: &str = "uvc_thread";

/// A UVC webcam gadget streaming the display.
pub struct UvcGadget {
    session: Arc<Session>,
    manager: Arc<dyn UdcDriverManager>,
    display: Arc<dyn Display>,
    converter: Arc<dyn PixelConverter>,
    driver: Arc<UvcClassDriver>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<GadgetResult<()>>>,
}

impl std::fmt::Debug for UvcGadget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UvcGadget")
            .field("driver", &self.driver.name())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl UvcGadget {
    /// Create a gadget using the software pixel converter.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::InvalidConfiguration`] if `config` is invalid.
    pub fn new(
        config: GadgetConfig,
        controller: Arc<dyn UsbDeviceController>,
        manager: Arc<dyn UdcDriverManager>,
        display: Arc<dyn Display>,
    ) -> GadgetResult<Self> {
        let session = Session::new(config, controller)?;
        let driver = Arc::new(UvcClassDriver::new(Arc::clone(&session)));
        Ok(Self {
            session,
            manager,
            display,
            converter: Arc::new(SoftwareConverter::new()),
            driver,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// Replace the pixel converter.
    #[must_use]
    pub fn with_converter(mut self, converter: Arc<dyn PixelConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn control(&self) -> &ControlStateMachine {
        self.driver.control()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.session.stats().snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Register the class driver and spawn the streaming thread.
    ///
    /// # Errors
    ///
    /// - [`GadgetError::AlreadyRunning`] if started twice
    /// - [`GadgetError::Driver`] if registration fails
    /// - [`GadgetError::ThreadSpawn`] if the thread cannot be created; the
    ///   driver is unregistered again
    pub fn start(&mut self) -> GadgetResult<()> {
        if self.is_running() {
            return Err(GadgetError::AlreadyRunning);
        }
        let name = self.driver.name().to_string();
        info!(driver = %name, "starting UVC gadget");

        let descriptors = DriverDescriptors::build()?;
        let class_driver: Arc<dyn ClassDriver> = self.driver.clone();
        self.manager
            .register(class_driver, descriptors)
            .map_err(|status| GadgetError::driver(name.as_str(), "register", status))?;

        let streaming = match StreamingLoop::new(
            Arc::clone(&self.session),
            Arc::clone(&self.display),
            Arc::clone(&self.converter),
            Arc::clone(&self.manager),
        ) {
            Ok(streaming) => streaming,
            Err(e) => {
                self.unregister(&name);
                return Err(e);
            }
        };

        self.running.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name(STREAMING_THREAD_NAME.to_string())
            .spawn(move || streaming.run())
            .map_err(|e| GadgetError::ThreadSpawn(e.to_string()));
        match handle {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.unregister(&name);
                return Err(e);
            }
        }

        info!("UVC gadget started");
        Ok(())
    }

    /// Stop the streaming thread, restore the stock drivers and unregister.
    ///
    /// # Errors
    ///
    /// Returns the streaming thread's error, or
    /// [`GadgetError::ThreadPanicked`] if it panicked.
    pub fn stop(&mut self) -> GadgetResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!("stopping UVC gadget");

        self.session.request_shutdown();
        let result = match self.thread.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => {
                error!("streaming thread panicked");
                Err(GadgetError::ThreadPanicked)
            }
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "streaming thread stopped with error");
        }

        let name = self.driver.name().to_string();
        self.unregister(&name);
        info!("UVC gadget stopped");
        result
    }

    fn unregister(&self, name: &str) {
        if let Err(status) = self.manager.unregister(name) {
            warn!(driver = name, %status, "failed to unregister class driver");
        }
    }
}

impl Drop for UvcGadget {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("UVC gadget dropped while still running - forcing stop");
            let _ = self.stop();
        }
    }
}
