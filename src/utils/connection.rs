//! PostgreSQL connection handling utilities
//!
//! Provides a safe wrapper around PostgreSQL's C library (libpq)
//! for the destination side of the sink. Handles connection lifecycle,
//! plain and parameterized statement execution, and result inspection.

use crate::core::errors::{SinkError, SinkResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

// Field code for the SQLSTATE of an error result ('C' in postgres_ext.h)
const PG_DIAG_SQLSTATE: c_int = b'C' as c_int;

/// Safe wrapper for PostgreSQL connection using libpq
///
/// Holds exactly one session. The session is never reopened: once it is
/// lost every call reports a connection error.
pub struct PGConnection {
    conn: *mut PGconn,
}

impl PGConnection {
    /// Establishes a connection to PostgreSQL using the provided connection info.
    ///
    /// # Arguments
    /// * `conninfo` - A string containing connection parameters (e.g., "host=localhost port=5432 dbname=test")
    ///
    /// # Returns
    /// A Result containing either a PGConnection instance or a connection error
    pub fn connect(conninfo: &str) -> SinkResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(SinkError::connection("Failed to allocate connection object"));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or("Unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(SinkError::connection(format!(
                "Connection failed: {}",
                error_msg.trim()
            )));
        }

        Ok(Self { conn })
    }

    /// Whether the session is still usable
    pub fn is_alive(&self) -> bool {
        unsafe { PQstatus(self.conn) == ConnStatusType::CONNECTION_OK }
    }

    /// Last error reported on the connection
    pub fn error_message(&self) -> String {
        get_error_message(self.conn)
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| "Unknown error".to_string())
    }

    /// Executes a query on the PostgreSQL connection.
    ///
    /// A null result means libpq could not even send the query, which only
    /// happens when the session is broken or out of memory.
    pub fn exec(&self, query: &str) -> SinkResult<PGResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            return Err(SinkError::connection(format!(
                "Query execution failed: {}",
                self.error_message()
            )));
        }

        Ok(PGResult { result })
    }

    /// Executes a parameterized query, all parameters sent in text format.
    ///
    /// `None` parameters are sent as SQL NULL.
    pub fn exec_params(&self, query: &str, params: &[Option<&str>]) -> SinkResult<PGResult> {
        let c_query = CString::new(query)?;

        // Keep the CStrings alive until PQexecParams returns
        let c_params = params
            .iter()
            .map(|p| p.map(CString::new).transpose())
            .collect::<Result<Vec<Option<CString>>, _>>()?;
        let param_ptrs: Vec<*const c_char> = c_params
            .iter()
            .map(|p| p.as_ref().map_or(ptr::null(), |s| s.as_ptr()))
            .collect();

        let n_params = c_int::try_from(param_ptrs.len()).map_err(|_| {
            SinkError::write(format!("Too many query parameters: {}", param_ptrs.len()))
        })?;

        let result = unsafe {
            PQexecParams(
                self.conn,
                c_query.as_ptr(),
                n_params,
                ptr::null(),
                param_ptrs.as_ptr(),
                ptr::null(),
                ptr::null(),
                0,
            )
        };

        if result.is_null() {
            return Err(SinkError::connection(format!(
                "Query execution failed: {}",
                self.error_message()
            )));
        }

        Ok(PGResult { result })
    }
}

impl Drop for PGConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
            self.conn = ptr::null_mut();
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().into_owned())
        }
    }
}

fn owned_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        unsafe { Some(CStr::from_ptr(ptr).to_string_lossy().into_owned()) }
    }
}

/// Safe wrapper for PostgreSQL result.
pub struct PGResult {
    result: *mut PGresult,
}

impl PGResult {
    /// Gets the status of the PostgreSQL result.
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// Checks if the PostgreSQL result is successful.
    ///
    /// True for PGRES_TUPLES_OK and PGRES_COMMAND_OK status codes.
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    /// Error message attached to this result, empty when the command succeeded
    pub fn error_message(&self) -> String {
        owned_c_string(unsafe { PQresultErrorMessage(self.result) })
            .map(|m| m.trim().to_string())
            .unwrap_or_default()
    }

    /// SQLSTATE code of a failed command, e.g. "23505" for unique_violation
    pub fn sql_state(&self) -> Option<String> {
        owned_c_string(unsafe { PQresultErrorField(self.result, PG_DIAG_SQLSTATE) })
    }

    /// Command tag, e.g. "INSERT 0 42" or "COMMIT"
    pub fn command_status(&self) -> String {
        owned_c_string(unsafe { PQcmdStatus(self.result) }).unwrap_or_default()
    }

    /// Number of rows affected by an INSERT/UPDATE/DELETE
    pub fn affected_rows(&self) -> u64 {
        owned_c_string(unsafe { PQcmdTuples(self.result) })
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl Drop for PGResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}
