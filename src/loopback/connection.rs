//! Loopback connections and streams

use super::{native_ptr_of, Loopback, Shared};
use crate::config::LoopbackConfig;
use crate::error::ErrorCode;
use crate::logging::{debug, trace};
use crate::native::{
    ConnectOptions, ConnectionApi, ConnectionSetupFn, NativePtr, RequestOptions, ShutdownFn,
    StreamCallbacks, UserData,
};
use core::ffi::c_void;
use parking_lot::Mutex;
use std::sync::Arc;

/// Host that always refuses connections
pub const REFUSED_HOST: &str = "refused";

pub(super) struct LoopConnection {
    host: String,
    on_shutdown: ShutdownFn,
    user_data: UserData,
    state: Mutex<ConnState>,
}

struct ConnState {
    open: bool,
    /// Activated, uncompleted streams; shutdown waits for them
    streams: usize,
    shutdown_code: ErrorCode,
    shutdown_sent: bool,
}

impl LoopConnection {
    pub(super) fn host(&self) -> &str {
        &self.host
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Start closing. Returns false if already closed.
    pub(super) fn close(self: &Arc<Self>, shared: &Arc<Shared>, code: ErrorCode) -> bool {
        let fire = {
            let mut state = self.state.lock();
            if !state.open {
                return false;
            }
            state.open = false;
            state.shutdown_code = code;
            Self::take_shutdown(&mut state)
        };
        debug!(event = "loopback_connection_closing", host = %self.host, code = code.0);
        if let Some(code) = fire {
            self.schedule_shutdown(shared, code);
        }
        true
    }

    fn begin_stream(&self) -> Result<(), ErrorCode> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ErrorCode::CONNECTION_CLOSED);
        }
        state.streams += 1;
        Ok(())
    }

    /// Activated streams still holding the connection open
    pub(super) fn active_streams(&self) -> usize {
        self.state.lock().streams
    }

    fn end_stream(self: &Arc<Self>, shared: &Arc<Shared>) {
        let fire = {
            let mut state = self.state.lock();
            state.streams -= 1;
            Self::take_shutdown(&mut state)
        };
        if let Some(code) = fire {
            self.schedule_shutdown(shared, code);
        }
    }

    /// Shutdown is due once closed with no stream left
    fn take_shutdown(state: &mut ConnState) -> Option<ErrorCode> {
        if state.open || state.streams > 0 || state.shutdown_sent {
            return None;
        }
        state.shutdown_sent = true;
        Some(state.shutdown_code)
    }

    fn schedule_shutdown(self: &Arc<Self>, shared: &Arc<Shared>, code: ErrorCode) {
        let conn = Arc::clone(self);
        shared.group.schedule(move || {
            trace!(event = "loopback_connection_shutdown", host = %conn.host, code = code.0);
            // Safety: callback and user_data were supplied together by the caller
            unsafe { (conn.on_shutdown)(code.0, conn.user_data.0) };
        });
    }
}

pub(super) struct LoopStream {
    connection: Arc<LoopConnection>,
    options: RequestOptions,
    callbacks: StreamCallbacks,
    state: Mutex<StreamState>,
}

// Safety: the raw `user_data` inside `callbacks` is only passed back to the
// callbacks it was registered with
unsafe impl Send for LoopStream {}
unsafe impl Sync for LoopStream {}

#[derive(Default)]
struct StreamState {
    activated: bool,
    completed: bool,
    released: bool,
    canceled: Option<ErrorCode>,
}

impl LoopStream {
    fn canceled(&self) -> Option<ErrorCode> {
        self.state.lock().canceled
    }

    fn check_running(&self) -> Result<(), ErrorCode> {
        if let Some(code) = self.canceled() {
            return Err(code);
        }
        if !self.connection.is_open() {
            return Err(ErrorCode::CONNECTION_CLOSED);
        }
        Ok(())
    }

    /// Pull the request body, then echo it back in chunks
    fn exchange(self: &Arc<Self>, config: &LoopbackConfig) -> Result<(), ErrorCode> {
        let user_data = self.callbacks.user_data;
        let mut body = Vec::new();

        if let Some(read_body) = self.callbacks.read_body {
            let mut buf = vec![0u8; config.chunk_size];
            loop {
                self.check_running()?;
                let mut written = 0usize;
                let mut eof = false;
                // Safety: buf is valid for buf.len() bytes for the whole call
                let rc = unsafe { read_body(buf.as_mut_ptr(), buf.len(), &mut written, &mut eof, user_data) };
                ErrorCode::check(rc)?;

                let written = written.min(buf.len());
                body.extend_from_slice(&buf[..written]);
                if body.len() > config.max_body_size {
                    return Err(ErrorCode::BODY_TOO_LARGE);
                }
                if eof || written == 0 {
                    break;
                }
            }
        }

        let response = if body.is_empty() {
            format!("{} {}", self.options.method, self.options.path).into_bytes()
        } else {
            body
        };

        let stream = native_ptr_of(self).as_ptr();
        for chunk in response.chunks(config.chunk_size) {
            self.check_running()?;
            if let Some(on_body) = self.callbacks.on_body {
                // Safety: chunk is valid for the duration of the call
                let rc = unsafe { on_body(stream, chunk.as_ptr(), chunk.len(), user_data) };
                ErrorCode::check(rc)?;
            }
        }
        Ok(())
    }

    fn run(self: Arc<Self>, shared: Arc<Shared>) {
        let result = self.exchange(&shared.config);
        let code = result.err().unwrap_or(ErrorCode::SUCCESS);
        let ptr = native_ptr_of(&self);

        let released = {
            let mut state = self.state.lock();
            state.completed = true;
            state.released
        };
        trace!(event = "loopback_stream_complete", code = code.0);
        // Safety: complete fires exactly once with the registered user_data
        unsafe { (self.callbacks.on_complete)(ptr.as_ptr(), code.0, self.callbacks.user_data) };

        if released {
            shared.streams.remove(&ptr.addr());
        }
        self.connection.end_stream(&shared);
    }
}

impl ConnectionApi for Loopback {
    fn connect(
        &self,
        options: &ConnectOptions,
        on_setup: ConnectionSetupFn,
        on_shutdown: ShutdownFn,
        user_data: *mut c_void,
    ) -> Result<(), ErrorCode> {
        if options.host.is_empty() {
            return Err(ErrorCode::INVALID_ARGUMENT);
        }

        let shared = Arc::clone(&self.shared);
        let options = options.clone();
        let user_data = UserData(user_data);
        self.shared.group.schedule(move || {
            // Capture the Send wrapper, not the raw pointer inside it
            let user_data = user_data;
            if options.host == REFUSED_HOST || options.port == 0 {
                debug!(event = "loopback_connect_refused", host = %options.host, port = options.port);
                // Safety: setup fires exactly once with the caller's user_data
                unsafe { on_setup(core::ptr::null_mut(), ErrorCode::CONNECTION_REFUSED.0, user_data.0) };
                return;
            }

            let conn = Arc::new(LoopConnection {
                host: options.host.clone(),
                on_shutdown,
                user_data,
                state: Mutex::new(ConnState {
                    open: true,
                    streams: 0,
                    shutdown_code: ErrorCode::SUCCESS,
                    shutdown_sent: false,
                }),
            });
            let ptr = native_ptr_of(&conn);
            shared.connections.insert(ptr.addr(), conn);
            debug!(event = "loopback_connected", host = %options.host, port = options.port);
            unsafe { on_setup(ptr.as_ptr(), ErrorCode::SUCCESS.0, user_data.0) };
        });
        Ok(())
    }

    fn close(&self, connection: NativePtr) {
        let conn = self.shared.connections.get(&connection.addr()).map(|c| Arc::clone(c.value()));
        if let Some(conn) = conn {
            conn.close(&self.shared, ErrorCode::SUCCESS);
        }
    }

    fn is_open(&self, connection: NativePtr) -> bool {
        self.shared
            .connections
            .get(&connection.addr())
            .is_some_and(|c| c.is_open())
    }

    fn release_connection(&self, connection: NativePtr) -> Result<(), ErrorCode> {
        let (_, conn) = self
            .shared
            .connections
            .remove(&connection.addr())
            .ok_or(ErrorCode::INVALID_ARGUMENT)?;
        conn.close(&self.shared, ErrorCode::SUCCESS);
        Ok(())
    }

    fn make_request(
        &self,
        connection: NativePtr,
        options: &RequestOptions,
        callbacks: StreamCallbacks,
    ) -> Result<NativePtr, ErrorCode> {
        let conn = self
            .shared
            .connections
            .get(&connection.addr())
            .map(|c| Arc::clone(c.value()))
            .ok_or(ErrorCode::INVALID_ARGUMENT)?;
        if !conn.is_open() {
            return Err(ErrorCode::CONNECTION_CLOSED);
        }
        if options.method.is_empty() {
            return Err(ErrorCode::INVALID_ARGUMENT);
        }

        let stream = Arc::new(LoopStream {
            connection: conn,
            options: options.clone(),
            callbacks,
            state: Mutex::new(StreamState::default()),
        });
        let ptr = native_ptr_of(&stream);
        self.shared.streams.insert(ptr.addr(), stream);
        Ok(ptr)
    }

    fn activate_stream(&self, stream: NativePtr) -> Result<(), ErrorCode> {
        let stream = self
            .shared
            .streams
            .get(&stream.addr())
            .map(|s| Arc::clone(s.value()))
            .ok_or(ErrorCode::INVALID_ARGUMENT)?;

        {
            let mut state = stream.state.lock();
            if state.activated {
                return Err(ErrorCode::INVALID_STATE);
            }
            stream.connection.begin_stream()?;
            state.activated = true;
        }

        let shared = Arc::clone(&self.shared);
        let job = Arc::clone(&stream);
        if !self.shared.group.schedule(move || job.run(shared)) {
            // Never ran: undo the activation so the connection can still shut down
            stream.state.lock().activated = false;
            stream.connection.end_stream(&self.shared);
            return Err(ErrorCode::SHUTDOWN_IN_PROGRESS);
        }
        Ok(())
    }

    fn cancel_stream(&self, stream: NativePtr, code: ErrorCode) {
        if let Some(stream) = self.shared.streams.get(&stream.addr()) {
            let mut state = stream.state.lock();
            if !state.completed && state.canceled.is_none() {
                debug!(event = "loopback_stream_cancel", code = code.0);
                state.canceled = Some(code);
            }
        }
    }

    fn release_stream(&self, stream: NativePtr) -> Result<(), ErrorCode> {
        let addr = stream.addr();
        let finished = {
            let entry = self.shared.streams.get(&addr).ok_or(ErrorCode::INVALID_ARGUMENT)?;
            let mut state = entry.state.lock();
            if state.released {
                return Err(ErrorCode::INVALID_STATE);
            }
            state.released = true;
            state.completed || !state.activated
        };
        if finished {
            self.shared.streams.remove(&addr);
        }
        Ok(())
    }
}
