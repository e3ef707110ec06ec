//! In-memory collaborators for tests.
//!
//! [`MockDeviceController`] records every request and completes chains either
//! immediately or on demand. [`MockDisplay`] serves fixed framebuffers and
//! fires vblank callbacks when told to. [`MockDriverManager`] logs driver
//! operations and can be told to fail any of them.
//!
//! Completions and callbacks are always invoked after the mock's lock is
//! released, so they may call back into the mock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::display::{Display, FramebufferInfo, SourcePixelFormat, VblankCallback, VblankId};
use crate::driver::{ClassDriver, DriverDescriptors, UdcDriverManager};
use crate::error::{DriverStatus, GadgetError, GadgetResult};
use crate::transport::{
    Completion, Endpoint, ReceiveCompletion, TransferStatus, UsbDeviceController,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// When submitted chains complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Inside `submit_chain`.
    #[default]
    Immediate,
    /// Only through [`MockDeviceController::complete_pending_chain`] or a cancel.
    Manual,
}

/// A chain as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedChain {
    pub endpoint: Endpoint,
    pub segments: Vec<Vec<u8>>,
}

impl SubmittedChain {
    /// Total bytes across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The segments joined back into one payload transfer.
    pub fn payload(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

type ChainHook = Arc<dyn Fn(&SubmittedChain) + Send + Sync>;

struct PendingChain {
    endpoint: Endpoint,
    len: usize,
    on_complete: Completion,
}

struct PendingReceive {
    endpoint: Endpoint,
    length: usize,
    on_complete: ReceiveCompletion,
}

#[derive(Default)]
struct ControllerState {
    mode: CompletionMode,
    sent: Vec<(Endpoint, Vec<u8>)>,
    chains: Vec<SubmittedChain>,
    pending_chains: VecDeque<PendingChain>,
    pending_receives: VecDeque<PendingReceive>,
    writeback_bytes: usize,
    invalidated_bytes: usize,
    cancels: HashMap<Endpoint, usize>,
    fifo_clears: HashMap<Endpoint, usize>,
    stalls: HashMap<Endpoint, usize>,
    fail_next_chain: Option<i32>,
    fail_next_submit: Option<i32>,
    chain_hook: Option<ChainHook>,
}

/// Recording device controller.
#[derive(Clone, Default)]
pub struct MockDeviceController {
    state: Arc<Mutex<ControllerState>>,
}

impl std::fmt::Debug for MockDeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockDeviceController")
            .field("mode", &state.mode)
            .field("chains", &state.chains.len())
            .field("pending_chains", &state.pending_chains.len())
            .finish_non_exhaustive()
    }
}

impl MockDeviceController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        lock(&self.state).mode = mode;
    }

    /// Complete the next submitted chain with `Error(code)`.
    pub fn fail_next_chain(&self, code: i32) {
        lock(&self.state).fail_next_chain = Some(code);
    }

    /// Reject the next chain submission outright.
    pub fn fail_next_submit(&self, code: i32) {
        lock(&self.state).fail_next_submit = Some(code);
    }

    /// Run `hook` for every chain after it is recorded, before it completes.
    pub fn on_chain(&self, hook: impl Fn(&SubmittedChain) + Send + Sync + 'static) {
        lock(&self.state).chain_hook = Some(Arc::new(hook));
    }

    /// Every chain submitted so far.
    pub fn chains(&self) -> Vec<SubmittedChain> {
        lock(&self.state).chains.clone()
    }

    pub fn clear_chains(&self) {
        lock(&self.state).chains.clear();
    }

    /// Remove and return the single sends made on `endpoint`.
    pub fn take_sent(&self, endpoint: Endpoint) -> Vec<Vec<u8>> {
        let mut state = lock(&self.state);
        let (taken, kept): (Vec<_>, Vec<_>) = state
            .sent
            .drain(..)
            .partition(|(ep, _)| *ep == endpoint);
        state.sent = kept;
        taken.into_iter().map(|(_, data)| data).collect()
    }

    pub fn writeback_bytes(&self) -> usize {
        lock(&self.state).writeback_bytes
    }

    pub fn invalidated_bytes(&self) -> usize {
        lock(&self.state).invalidated_bytes
    }

    pub fn cancel_count(&self, endpoint: Endpoint) -> usize {
        lock(&self.state).cancels.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn fifo_clear_count(&self, endpoint: Endpoint) -> usize {
        lock(&self.state)
            .fifo_clears
            .get(&endpoint)
            .copied()
            .unwrap_or(0)
    }

    pub fn stall_count(&self, endpoint: Endpoint) -> usize {
        lock(&self.state).stalls.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn pending_chain_count(&self) -> usize {
        lock(&self.state).pending_chains.len()
    }

    /// Complete the oldest pending chain. Returns `false` if none is pending.
    pub fn complete_pending_chain(&self) -> bool {
        let (pending, failure) = {
            let mut state = lock(&self.state);
            let Some(pending) = state.pending_chains.pop_front() else {
                return false;
            };
            (pending, state.fail_next_chain.take())
        };
        let status = match failure {
            Some(code) => TransferStatus::Error(code),
            None => TransferStatus::Completed {
                transferred: pending.len,
            },
        };
        (pending.on_complete)(status);
        true
    }

    /// Complete the oldest EP0 receive with `data`. Returns `false` if no
    /// receive is pending.
    pub fn deliver_control_data(&self, data: &[u8]) -> bool {
        let pending = {
            let mut state = lock(&self.state);
            let index = state
                .pending_receives
                .iter()
                .position(|r| r.endpoint == Endpoint::CONTROL);
            match index.and_then(|i| state.pending_receives.remove(i)) {
                Some(pending) => pending,
                None => return false,
            }
        };
        let n = data.len().min(pending.length);
        (pending.on_complete)(TransferStatus::Completed { transferred: n }, &data[..n]);
        true
    }
}

impl UsbDeviceController for MockDeviceController {
    fn send(&self, endpoint: Endpoint, data: &[u8]) -> GadgetResult<()> {
        lock(&self.state).sent.push((endpoint, data.to_vec()));
        Ok(())
    }

    fn receive(
        &self,
        endpoint: Endpoint,
        length: usize,
        on_complete: ReceiveCompletion,
    ) -> GadgetResult<()> {
        lock(&self.state).pending_receives.push_back(PendingReceive {
            endpoint,
            length,
            on_complete,
        });
        Ok(())
    }

    fn submit_chain(
        &self,
        endpoint: Endpoint,
        segments: &[&[u8]],
        on_complete: Completion,
    ) -> GadgetResult<()> {
        let chain = SubmittedChain {
            endpoint,
            segments: segments.iter().map(|s| s.to_vec()).collect(),
        };
        let len = chain.len();

        let (hook, immediate) = {
            let mut state = lock(&self.state);
            if let Some(code) = state.fail_next_submit.take() {
                return Err(GadgetError::transport(endpoint.number(), code));
            }
            state.chains.push(chain.clone());
            let hook = state.chain_hook.clone();
            match state.mode {
                CompletionMode::Immediate => {
                    let status = match state.fail_next_chain.take() {
                        Some(code) => TransferStatus::Error(code),
                        None => TransferStatus::Completed { transferred: len },
                    };
                    (hook, Some((on_complete, status)))
                }
                CompletionMode::Manual => {
                    state.pending_chains.push_back(PendingChain {
                        endpoint,
                        len,
                        on_complete,
                    });
                    (hook, None)
                }
            }
        };

        if let Some(hook) = hook {
            hook(&chain);
        }
        if let Some((on_complete, status)) = immediate {
            on_complete(status);
        }
        Ok(())
    }

    fn cancel_all(&self, endpoint: Endpoint) -> GadgetResult<()> {
        let (chains, receives) = {
            let mut state = lock(&self.state);
            *state.cancels.entry(endpoint).or_default() += 1;
            let (chains, kept): (VecDeque<_>, VecDeque<_>) = state
                .pending_chains
                .drain(..)
                .partition(|c| c.endpoint == endpoint);
            state.pending_chains = kept;
            let (receives, kept): (VecDeque<_>, VecDeque<_>) = state
                .pending_receives
                .drain(..)
                .partition(|r| r.endpoint == endpoint);
            state.pending_receives = kept;
            (chains, receives)
        };

        for chain in chains {
            (chain.on_complete)(TransferStatus::Cancelled);
        }
        for receive in receives {
            (receive.on_complete)(TransferStatus::Cancelled, &[]);
        }
        Ok(())
    }

    fn clear_fifo(&self, endpoint: Endpoint) -> GadgetResult<()> {
        *lock(&self.state).fifo_clears.entry(endpoint).or_default() += 1;
        Ok(())
    }

    fn stall(&self, endpoint: Endpoint) -> GadgetResult<()> {
        *lock(&self.state).stalls.entry(endpoint).or_default() += 1;
        Ok(())
    }

    fn writeback_range(&self, data: &[u8]) {
        lock(&self.state).writeback_bytes += data.len();
    }

    fn invalidate_range(&self, length: usize) {
        lock(&self.state).invalidated_bytes += length;
    }
}

struct DisplayState {
    head: u32,
    levels: [Option<FramebufferInfo>; 2],
    queried: Vec<u32>,
    callbacks: Vec<(VblankId, Arc<dyn Fn(u32) + Send + Sync>)>,
    next_id: u64,
    framebuffer_waits: usize,
}

/// Display serving fixed framebuffers.
#[derive(Clone)]
pub struct MockDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl std::fmt::Debug for MockDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockDisplay")
            .field("head", &state.head)
            .field("callbacks", &state.callbacks.len())
            .finish_non_exhaustive()
    }
}

impl MockDisplay {
    /// Display whose levels both show `info`.
    pub fn new(info: FramebufferInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(DisplayState {
                head: 0,
                levels: [Some(info.clone()), Some(info)],
                queried: Vec::new(),
                callbacks: Vec::new(),
                next_id: 1,
                framebuffer_waits: 0,
            })),
        }
    }

    /// Display showing a solid A8B8G8R8 colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixel = [rgb[0], rgb[1], rgb[2], 0xFF];
        let pixels: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * pixel.len())
            .collect();
        Self::new(FramebufferInfo {
            width,
            height,
            pitch: width,
            pixel_format: SourcePixelFormat::A8B8G8R8,
            pixels: Some(Arc::from(pixels)),
        })
    }

    /// Replace a level; `None` makes queries for it fail.
    pub fn set_level(&self, level: usize, info: Option<FramebufferInfo>) {
        if let Some(slot) = lock(&self.state).levels.get_mut(level) {
            *slot = info;
        }
    }

    /// Levels queried so far, in order.
    pub fn queried_levels(&self) -> Vec<u32> {
        lock(&self.state).queried.clone()
    }

    pub fn framebuffer_waits(&self) -> usize {
        lock(&self.state).framebuffer_waits
    }

    pub fn vblank_callback_count(&self) -> usize {
        lock(&self.state).callbacks.len()
    }

    /// Deliver `count` vblanks to every registered callback.
    pub fn fire_vblank(&self, count: u32) {
        let callbacks: Vec<_> = lock(&self.state)
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in callbacks {
            cb(count);
        }
    }
}

impl Display for MockDisplay {
    fn wait_for_framebuffer_set(&self) -> GadgetResult<()> {
        lock(&self.state).framebuffer_waits += 1;
        Ok(())
    }

    fn primary_head(&self) -> u32 {
        lock(&self.state).head
    }

    fn framebuffer(&self, head: u32, level: u32) -> GadgetResult<FramebufferInfo> {
        let mut state = lock(&self.state);
        state.queried.push(level);
        state
            .levels
            .get(level as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| GadgetError::display(format!("head {head} level {level} unavailable")))
    }

    fn register_vblank(&self, callback: VblankCallback) -> GadgetResult<VblankId> {
        let mut state = lock(&self.state);
        let id = VblankId(state.next_id);
        state.next_id += 1;
        state.callbacks.push((id, Arc::from(callback)));
        Ok(id)
    }

    fn unregister_vblank(&self, id: VblankId) -> GadgetResult<()> {
        let mut state = lock(&self.state);
        let before = state.callbacks.len();
        state.callbacks.retain(|(cb_id, _)| *cb_id != id);
        if state.callbacks.len() == before {
            return Err(GadgetError::display(format!("unknown vblank id {}", id.0)));
        }
        Ok(())
    }
}

/// A driver manager operation, as logged by [`MockDriverManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Register(String),
    Unregister(String),
    Start(String),
    Stop(String),
    Activate(u16),
    Deactivate,
}

#[derive(Default)]
struct ManagerState {
    calls: Vec<DriverCall>,
    active: Option<u16>,
    registered: Option<(Arc<dyn ClassDriver>, DriverDescriptors)>,
    fail_register: Option<DriverStatus>,
    fail_start: HashMap<String, DriverStatus>,
    fail_activate: Option<DriverStatus>,
}

/// Logging driver manager.
#[derive(Clone, Default)]
pub struct MockDriverManager {
    state: Arc<Mutex<ManagerState>>,
}

impl std::fmt::Debug for MockDriverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockDriverManager")
            .field("calls", &state.calls)
            .field("active", &state.active)
            .finish_non_exhaustive()
    }
}

impl MockDriverManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        lock(&self.state).calls.clone()
    }

    /// Product ID currently presented to the host.
    pub fn active_product(&self) -> Option<u16> {
        lock(&self.state).active
    }

    pub fn registered_driver(&self) -> Option<Arc<dyn ClassDriver>> {
        lock(&self.state)
            .registered
            .as_ref()
            .map(|(driver, _)| Arc::clone(driver))
    }

    pub fn registered_descriptors(&self) -> Option<DriverDescriptors> {
        lock(&self.state)
            .registered
            .as_ref()
            .map(|(_, descriptors)| descriptors.clone())
    }

    pub fn fail_register(&self, status: DriverStatus) {
        lock(&self.state).fail_register = Some(status);
    }

    pub fn fail_start(&self, name: &str, status: DriverStatus) {
        lock(&self.state).fail_start.insert(name.to_string(), status);
    }

    pub fn fail_activate(&self, status: DriverStatus) {
        lock(&self.state).fail_activate = Some(status);
    }
}

impl UdcDriverManager for MockDriverManager {
    fn register(
        &self,
        driver: Arc<dyn ClassDriver>,
        descriptors: DriverDescriptors,
    ) -> Result<(), DriverStatus> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Register(driver.name().to_string()));
        if let Some(status) = state.fail_register {
            return Err(status);
        }
        state.registered = Some((driver, descriptors));
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<(), DriverStatus> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Unregister(name.to_string()));
        match state.registered.take() {
            Some((driver, _)) if driver.name() == name => Ok(()),
            other => {
                state.registered = other;
                Err(DriverStatus::NotActive)
            }
        }
    }

    fn start(&self, name: &str) -> Result<(), DriverStatus> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Start(name.to_string()));
        match state.fail_start.get(name) {
            Some(status) => Err(*status),
            None => Ok(()),
        }
    }

    fn stop(&self, name: &str) -> Result<(), DriverStatus> {
        lock(&self.state).calls.push(DriverCall::Stop(name.to_string()));
        Ok(())
    }

    fn activate(&self, product_id: u16) -> Result<(), DriverStatus> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Activate(product_id));
        if let Some(status) = state.fail_activate {
            return Err(status);
        }
        state.active = Some(product_id);
        Ok(())
    }

    fn deactivate(&self) -> Result<(), DriverStatus> {
        let mut state = lock(&self.state);
        state.calls.push(DriverCall::Deactivate);
        match state.active.take() {
            Some(_) => Ok(()),
            None => Err(DriverStatus::NotActive),
        }
    }
}
