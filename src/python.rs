//! `_native_bridge` Python extension module
//!
//! Every function runs on the process-wide `PythonRuntime` and a loopback
//! library configured from `NATIVE_BRIDGE_*` variables. Callbacks arrive on
//! event-loop threads and take the GIL themselves.

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lock::{self, LockToken};
use crate::logging::{self, LogConfig, LogFormat};
use crate::native::{Credentials, RequestOptions, SignableRequest, SigningConfig};
use crate::runtime::{PyPtr, PythonRuntime};
use once_cell::sync::OnceCell;
use pyo3::exceptions::{PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use std::time::Duration;

static BRIDGE: OnceCell<Bridge<PythonRuntime>> = OnceCell::new();

fn bridge() -> PyResult<&'static Bridge<PythonRuntime>> {
    BRIDGE.get_or_try_init(|| {
        let config = BridgeConfig::from_env().map_err(to_py_err)?;
        Bridge::loopback(PythonRuntime::global(), config).map_err(to_py_err)
    })
}

fn to_py_err(err: BridgeError) -> PyErr {
    match err {
        BridgeError::WrongHandle { .. } => PyErr::new::<PyTypeError, _>(err.to_string()),
        BridgeError::Config(_) => PyErr::new::<PyValueError, _>(err.to_string()),
        _ => PyErr::new::<PyRuntimeError, _>(err.to_string()),
    }
}

/// Borrow the GIL pyo3 already holds as a bridge lock token
fn with_lock<T>(
    _py: Python<'_>,
    f: impl FnOnce(&Bridge<PythonRuntime>, &LockToken<'_, PythonRuntime>) -> Result<T, BridgeError>,
) -> PyResult<T> {
    let bridge = bridge()?;
    let lock = lock::current(&**bridge.runtime())
        .ok_or_else(|| PyErr::new::<PyRuntimeError, _>("interpreter lock is not held"))?;
    f(bridge, &lock).map_err(to_py_err)
}

fn owned(py: Python<'_>, obj: PyPtr) -> PyObject {
    // Safety: bridge operations return new references
    unsafe { obj.into_object(py) }
}

#[pyfunction]
#[pyo3(signature = (level = None, json = false))]
fn init_logging(level: Option<String>, json: bool) {
    let mut config = LogConfig::from_env();
    if let Some(level) = level {
        config.level = level.to_lowercase();
    }
    if json {
        config.format = LogFormat::Json;
    }
    logging::init_with_config(&config);
}

/// Wait for native background work, GIL released. False on timeout.
#[pyfunction]
#[pyo3(signature = (timeout_ms = None))]
fn join_all_threads(py: Python<'_>, timeout_ms: Option<u64>) -> PyResult<bool> {
    with_lock(py, |bridge, lock| {
        Ok(bridge.join_all_threads(lock, timeout_ms.map(Duration::from_millis)))
    })
}

#[pyfunction]
#[pyo3(signature = (host, port, on_setup, on_shutdown = None, bootstrap = None))]
fn connect(
    py: Python<'_>,
    host: &str,
    port: u16,
    on_setup: &PyAny,
    on_shutdown: Option<&PyAny>,
    bootstrap: Option<&PyAny>,
) -> PyResult<()> {
    let on_setup = PyPtr::from_any(on_setup);
    let on_shutdown = on_shutdown.map(PyPtr::from_any);
    let bootstrap = bootstrap.map(PyPtr::from_any);
    with_lock(py, |bridge, lock| {
        bridge.connect(lock, host, port, bootstrap.as_ref(), &on_setup, on_shutdown.as_ref())
    })
}

#[pyfunction]
fn close_connection(py: Python<'_>, connection: &PyAny) -> PyResult<()> {
    let connection = PyPtr::from_any(connection);
    with_lock(py, |bridge, lock| bridge.close_connection(lock, &connection))
}

#[pyfunction]
fn is_connection_open(py: Python<'_>, connection: &PyAny) -> PyResult<bool> {
    let connection = PyPtr::from_any(connection);
    with_lock(py, |bridge, lock| bridge.is_connection_open(lock, &connection))
}

#[pyfunction]
#[pyo3(signature = (connection, method, path, on_complete, headers = Vec::new(), body = None, on_body = None))]
#[allow(clippy::too_many_arguments)]
fn request(
    py: Python<'_>,
    connection: &PyAny,
    method: String,
    path: String,
    on_complete: &PyAny,
    headers: Vec<(String, String)>,
    body: Option<&PyAny>,
    on_body: Option<&PyAny>,
) -> PyResult<PyObject> {
    let connection = PyPtr::from_any(connection);
    let on_complete = PyPtr::from_any(on_complete);
    let body = body.map(PyPtr::from_any);
    let on_body = on_body.map(PyPtr::from_any);
    let options = RequestOptions { method, path, headers };
    let stream = with_lock(py, |bridge, lock| {
        bridge.request(lock, &connection, options, body.as_ref(), on_body.as_ref(), &on_complete)
    })?;
    Ok(owned(py, stream))
}

#[pyfunction]
fn cancel_stream(py: Python<'_>, stream: &PyAny) -> PyResult<()> {
    let stream = PyPtr::from_any(stream);
    with_lock(py, |bridge, lock| bridge.cancel_stream(lock, &stream))
}

#[pyfunction]
#[pyo3(signature = (access_key_id, secret_access_key, session_token = None))]
fn static_credentials_provider(
    py: Python<'_>,
    access_key_id: &str,
    secret_access_key: &str,
    session_token: Option<&str>,
) -> PyResult<PyObject> {
    let mut credentials = Credentials::new(access_key_id, secret_access_key);
    if let Some(token) = session_token {
        credentials = credentials.with_session_token(token);
    }
    let provider = with_lock(py, |bridge, lock| bridge.static_credentials_provider(lock, &credentials))?;
    Ok(owned(py, provider))
}

#[pyfunction]
fn delegate_credentials_provider(py: Python<'_>, delegate: &PyAny) -> PyResult<PyObject> {
    if !delegate.is_callable() {
        return Err(PyErr::new::<PyTypeError, _>("delegate must be callable"));
    }
    let delegate = PyPtr::from_any(delegate);
    let provider = with_lock(py, |bridge, lock| bridge.delegate_credentials_provider(lock, &delegate))?;
    Ok(owned(py, provider))
}

#[pyfunction]
fn get_credentials(py: Python<'_>, provider: &PyAny, on_complete: &PyAny) -> PyResult<()> {
    let provider = PyPtr::from_any(provider);
    let on_complete = PyPtr::from_any(on_complete);
    with_lock(py, |bridge, lock| bridge.get_credentials(lock, &provider, &on_complete))
}

#[pyfunction]
#[pyo3(signature = (provider, method, path, region, service, timestamp, on_complete, headers = Vec::new(), body = None))]
#[allow(clippy::too_many_arguments)]
fn sign_request(
    py: Python<'_>,
    provider: &PyAny,
    method: String,
    path: String,
    region: String,
    service: String,
    timestamp: u64,
    on_complete: &PyAny,
    headers: Vec<(String, String)>,
    body: Option<&[u8]>,
) -> PyResult<()> {
    let provider = PyPtr::from_any(provider);
    let on_complete = PyPtr::from_any(on_complete);
    let request = SignableRequest {
        method,
        path,
        headers,
        body: body.map(<[u8]>::to_vec).unwrap_or_default(),
    };
    let config = SigningConfig {
        region,
        service,
        timestamp,
    };
    with_lock(py, |bridge, lock| {
        bridge.sign_request(lock, &provider, &request, &config, &on_complete)
    })
}

/// Registered with `atexit`: callbacks arriving after this are dropped
#[pyfunction]
fn _on_exit() {
    PythonRuntime::mark_finalizing();
}

#[pymodule]
fn _native_bridge(py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(join_all_threads, m)?)?;
    m.add_function(wrap_pyfunction!(connect, m)?)?;
    m.add_function(wrap_pyfunction!(close_connection, m)?)?;
    m.add_function(wrap_pyfunction!(is_connection_open, m)?)?;
    m.add_function(wrap_pyfunction!(request, m)?)?;
    m.add_function(wrap_pyfunction!(cancel_stream, m)?)?;
    m.add_function(wrap_pyfunction!(static_credentials_provider, m)?)?;
    m.add_function(wrap_pyfunction!(delegate_credentials_provider, m)?)?;
    m.add_function(wrap_pyfunction!(get_credentials, m)?)?;
    m.add_function(wrap_pyfunction!(sign_request, m)?)?;

    let on_exit = wrap_pyfunction!(_on_exit, m)?;
    py.import("atexit")?.call_method1("register", (on_exit,))?;
    Ok(())
}
