//! Lock-free storage for C function pointers.

use std::cell::Cell;
use std::ffi::{c_char, CString};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::models::audio_models::PcmFrame;
use crate::models::state::CaptureState;
use crate::traits::delivery_sink::DeliverySink;

/// `fn(bytes, byte_len, sample_rate, channels, bits_per_sample)`.
///
/// `bytes` is valid only for the duration of the call.
pub type PcmCallback = unsafe extern "C" fn(*const u8, usize, f64, i32, i32);

/// `fn(message)`; `message` is a NUL-terminated UTF-8 string valid only for
/// the duration of the call.
pub type ErrorCallback = unsafe extern "C" fn(*const c_char);

/// `fn(state)` with the codes of `CaptureState::as_code`.
pub type StateCallback = unsafe extern "C" fn(i32);

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside a registry callback.
pub(crate) fn in_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// One function-pointer slot. Zero means unset.
struct Slot(AtomicUsize);

impl Slot {
    const fn empty() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn store(&self, address: usize) {
        self.0.store(address, Ordering::SeqCst);
    }

    fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// The registry's three callback slots plus an in-flight counter.
///
/// Writers publish with `SeqCst` stores; the delivery path loads the slot and
/// calls through it without taking any lock. Only the last invocation to
/// finish touches `idle`, to wake a waiting `drain`.
pub(crate) struct CallbackSlots {
    pcm: Slot,
    error: Slot,
    state: Slot,
    in_flight: AtomicUsize,
    last_state: AtomicI32,
    idle: Mutex<()>,
    idle_cv: Condvar,
}

impl CallbackSlots {
    pub(crate) fn new() -> Self {
        Self {
            pcm: Slot::empty(),
            error: Slot::empty(),
            state: Slot::empty(),
            in_flight: AtomicUsize::new(0),
            last_state: AtomicI32::new(0),
            idle: Mutex::new(()),
            idle_cv: Condvar::new(),
        }
    }

    pub(crate) fn set_pcm(&self, callback: Option<PcmCallback>) {
        self.pcm.store(callback.map_or(0, |f| f as usize));
    }

    pub(crate) fn set_error(&self, callback: Option<ErrorCallback>) {
        self.error.store(callback.map_or(0, |f| f as usize));
    }

    pub(crate) fn set_state(&self, callback: Option<StateCallback>) {
        self.state.store(callback.map_or(0, |f| f as usize));
    }

    pub(crate) fn clear(&self) {
        self.pcm.store(0);
        self.error.store(0);
        self.state.store(0);
    }

    pub(crate) fn last_state(&self) -> CaptureState {
        CaptureState::from_code(self.last_state.load(Ordering::SeqCst)).unwrap_or_default()
    }

    pub(crate) fn record_state(&self, state: CaptureState) {
        self.last_state.store(state.as_code(), Ordering::SeqCst);
    }

    /// Wait until no callback invocation is running on another thread.
    ///
    /// Skipped when called from inside a callback, which would otherwise wait
    /// on itself.
    pub(crate) fn drain(&self) {
        if in_callback() {
            return;
        }
        let mut idle = self.idle.lock();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.idle_cv.wait(&mut idle);
        }
    }

    /// Run `f` with the slot's address while counted as in flight.
    fn invoke(&self, slot: &Slot, f: impl FnOnce(usize)) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let address = slot.load();
        if address != 0 {
            let nested = IN_CALLBACK.with(|c| c.replace(true));
            f(address);
            IN_CALLBACK.with(|c| c.set(nested));
        }
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Taking the lock orders this wakeup after drain's check.
            let _idle = self.idle.lock();
            self.idle_cv.notify_all();
        }
    }

    pub(crate) fn emit_pcm(&self, frame: &PcmFrame) {
        self.invoke(&self.pcm, |address| {
            // SAFETY: non-zero addresses are only ever stored from a valid `PcmCallback`.
            let callback: PcmCallback = unsafe { std::mem::transmute::<usize, PcmCallback>(address) };
            let bytes = frame.as_bytes();
            unsafe {
                callback(
                    bytes.as_ptr(),
                    bytes.len(),
                    frame.format.sample_rate,
                    i32::from(frame.format.channels),
                    i32::from(frame.format.bits_per_sample),
                )
            };
        });
    }

    pub(crate) fn emit_error(&self, message: &str) {
        self.invoke(&self.error, |address| {
            // SAFETY: non-zero addresses are only ever stored from a valid `ErrorCallback`.
            let callback: ErrorCallback =
                unsafe { std::mem::transmute::<usize, ErrorCallback>(address) };
            let message = to_c_string(message);
            unsafe { callback(message.as_ptr()) };
        });
    }

    pub(crate) fn emit_state(&self, state: CaptureState) {
        self.invoke(&self.state, |address| {
            // SAFETY: non-zero addresses are only ever stored from a valid `StateCallback`.
            let callback: StateCallback =
                unsafe { std::mem::transmute::<usize, StateCallback>(address) };
            unsafe { callback(state.as_code()) };
        });
    }
}

fn to_c_string(message: &str) -> CString {
    CString::new(message.replace('\0', " ")).unwrap_or_default()
}

/// `DeliverySink` adapter that forwards into the callback slots.
pub(crate) struct SlotSink {
    slots: Arc<CallbackSlots>,
}

impl SlotSink {
    pub(crate) fn new(slots: Arc<CallbackSlots>) -> Self {
        Self { slots }
    }
}

impl DeliverySink for SlotSink {
    fn on_pcm_data(&self, frame: &PcmFrame) {
        self.slots.emit_pcm(frame);
    }

    fn on_error(&self, message: &str) {
        self.slots.emit_error(message);
    }

    fn on_state_changed(&self, state: CaptureState) {
        self.slots.record_state(state);
        self.slots.emit_state(state);
    }
}
