//! # Supplement Store Core
//!
//! An embeddable local store that reconciles dietary-supplement product data
//! from several sources (AI extraction, an external product catalog, manual
//! user corrections) into one canonical, versioned record per product.
//!
//! ## Features
//!
//! - **Versioned records**: legacy data is migrated on load, failures are kept verbatim
//! - **Identity resolution**: barcode first, then a normalized brand/name/ingredient/form key
//! - **Provenance tracking**: every field remembers which source last set it
//! - **Crash-safe persistence**: backup-before-write with bounded retention, on a
//!   JSON file or inside an LMDB environment
//! - **FFI-ready**: every operation is exposed as a C function returning a JSON envelope
//!
//! ## Quick Start
//!
//! ```no_run
//! use supplement_store_core::{create_store, get_or_create, free_response};
//! use std::ffi::CString;
//!
//! let config = CString::new(r#"{"path":"./supplements"}"#).unwrap();
//! let store = create_store(config.as_ptr());
//!
//! let candidate = CString::new(
//!     r#"{"brand":"SOLID","productName":"Magnesium Bisglycinate 400mg","form":"capsule"}"#,
//! ).unwrap();
//! let response = get_or_create(store, std::ptr::null(), candidate.as_ptr());
//! free_response(response);
//! ```
//!
//! ## FFI Functions
//!
//! - [`create_store`] - Open (and migrate) a store from a JSON config
//! - [`get_or_create`] - Look up by barcode or create from a candidate
//! - [`get_by_barcode`] - Retrieve a record by barcode
//! - [`update_record`] - Apply a user correction
//! - [`merge_record`] - Fold a provider candidate into an existing record
//! - [`delete_record`] - Remove a record by barcode
//! - [`search_records`] - Text search with filters and pagination
//! - [`store_stats`] - Aggregate counts
//! - [`run_migration`] - Re-run schema migration
//! - [`close_store`] - Sync and release the store
//! - [`free_response`] - Release a returned JSON string

pub mod app_response;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod identity;
pub mod merge;
pub mod migration;
pub mod schema;
pub mod storage;
pub mod supplement_model;
pub mod supplement_store;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::app_response::AppResponse;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::supplement_model::CandidateRecord;
use crate::supplement_store::{SearchQuery, SupplementStore};

/// Opens a store described by a JSON [`StoreConfig`].
///
/// The container under `path` is created if missing and migrated if it holds
/// legacy records.
///
/// # Returns
///
/// A pointer to the [`SupplementStore`], or null when the config is missing,
/// malformed or the store cannot be initialized. Release it with
/// [`close_store`].
///
/// # Examples
///
/// ```no_run
/// use std::ffi::CString;
/// use supplement_store_core::create_store;
///
/// let config = CString::new(r#"{"path":"./db","backend":"lmdb"}"#).unwrap();
/// let store = create_store(config.as_ptr());
///
/// if !store.is_null() {
///     // Store ready
/// }
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_store(config_json: *const c_char) -> *mut SupplementStore {
    if config_json.is_null() {
        warn!("Null config pointer passed to create_store");
        return std::ptr::null_mut();
    }

    let json = match unsafe { CStr::from_ptr(config_json).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in config: {e}");
            return std::ptr::null_mut();
        }
    };

    let config = match StoreConfig::from_json(json) {
        Ok(config) => config,
        Err(e) => {
            warn!("Invalid store config: {e}");
            return std::ptr::null_mut();
        }
    };

    info!("Opening store at {}", config.path.display());
    match SupplementStore::open(config) {
        Ok(store) => Box::into_raw(Box::new(store)),
        Err(e) => {
            warn!("Failed to initialize store: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Returns the record for `barcode`, or resolves/creates one from
/// `candidate_json`. Either argument may be null, not both.
///
/// # JSON Format
///
/// The candidate is any subset of the record fields plus an optional
/// `source` (`"ai"`, `"external-catalog"` or `"user"`):
/// ```json
/// {
///   "brand": "SOLID",
///   "productName": "Magnesium Bisglycinate 400mg",
///   "ingredients": [{"name": "Magnesium bisglycinate", "dosage": 400, "unit": "mg"}],
///   "form": "capsule",
///   "source": "ai"
/// }
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_or_create(
    store: *mut SupplementStore,
    barcode: *const c_char,
    candidate_json: *const c_char,
) -> *const c_char {
    let store = match store_ref(store, "get_or_create") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let barcode = match optional_c_str(barcode, "barcode") {
        Ok(barcode) => barcode,
        Err(error_ptr) => return error_ptr,
    };
    let candidate = match optional_c_str(candidate_json, "candidate") {
        Ok(Some(json)) => match parse_candidate(&json) {
            Ok(candidate) => Some(candidate),
            Err(error_ptr) => return error_ptr,
        },
        Ok(None) => None,
        Err(error_ptr) => return error_ptr,
    };

    let result = store.get_or_create(barcode.as_deref(), candidate);
    response_to_c_string(&AppResponse::from_written(result))
}

/// Retrieves the record holding `barcode`.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_store`]
/// * `barcode` - Null-terminated C string; surrounding whitespace is ignored
///
/// # Returns
///
/// A JSON envelope whose `data` is the record. Release it with [`free_response`].
///
/// # Errors
///
/// * `BadRequest` - null pointer or invalid UTF-8
/// * `NotFoundError` - no record carries the barcode
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_by_barcode(store: *mut SupplementStore, barcode: *const c_char) -> *const c_char {
    let store = match store_ref(store, "get_by_barcode") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let barcode = match c_ptr_to_string(barcode, "barcode") {
        Ok(barcode) => barcode,
        Err(error_ptr) => return error_ptr,
    };

    response_to_c_string(&AppResponse::from_result(store.get_by_barcode(&barcode)))
}

/// Applies a user correction. Every field present in `updates_json` is
/// force-written and the record becomes verified.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn update_record(
    store: *mut SupplementStore,
    barcode: *const c_char,
    updates_json: *const c_char,
) -> *const c_char {
    let store = match store_ref(store, "update_record") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let barcode = match c_ptr_to_string(barcode, "barcode") {
        Ok(barcode) => barcode,
        Err(error_ptr) => return error_ptr,
    };
    let updates = match c_ptr_to_string(updates_json, "updates").and_then(|json| parse_candidate(&json)) {
        Ok(updates) => updates,
        Err(error_ptr) => return error_ptr,
    };

    response_to_c_string(&AppResponse::from_written(store.update(&barcode, updates)))
}

/// Merges a provider candidate into the record it resolves to, filling gaps
/// only. `barcode` may be null.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn merge_record(
    store: *mut SupplementStore,
    barcode: *const c_char,
    candidate_json: *const c_char,
) -> *const c_char {
    let store = match store_ref(store, "merge_record") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let barcode = match optional_c_str(barcode, "barcode") {
        Ok(barcode) => barcode,
        Err(error_ptr) => return error_ptr,
    };
    let candidate = match c_ptr_to_string(candidate_json, "candidate").and_then(|json| parse_candidate(&json)) {
        Ok(candidate) => candidate,
        Err(error_ptr) => return error_ptr,
    };

    let result = store.merge_from_source(barcode.as_deref(), candidate);
    response_to_c_string(&AppResponse::from_written(result))
}

/// Removes the record holding `barcode`. A backup of the container is taken
/// before the write.
///
/// # Parameters
///
/// * `store` - Pointer returned by [`create_store`]
/// * `barcode` - Null-terminated C string
///
/// # Returns
///
/// A JSON envelope whose `data` is the removed record. Release it with
/// [`free_response`].
///
/// # Errors
///
/// * `BadRequest` - null pointer or invalid UTF-8
/// * `NotFoundError` - no record carries the barcode
/// * `PersistenceError` - the backup or the write failed; nothing changed
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn delete_record(store: *mut SupplementStore, barcode: *const c_char) -> *const c_char {
    let store = match store_ref(store, "delete_record") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let barcode = match c_ptr_to_string(barcode, "barcode") {
        Ok(barcode) => barcode,
        Err(error_ptr) => return error_ptr,
    };

    response_to_c_string(&AppResponse::from_written(store.delete(&barcode)))
}

/// Searches records. A null `query_json` returns the first page of all
/// records.
///
/// # JSON Format
///
/// ```json
/// {"text": "magnesium", "category": "mineral", "verified": true, "offset": 0, "limit": 20}
/// ```
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn search_records(store: *mut SupplementStore, query_json: *const c_char) -> *const c_char {
    let store = match store_ref(store, "search_records") {
        Ok(store) => store,
        Err(error_ptr) => return error_ptr,
    };
    let query = match optional_c_str(query_json, "query") {
        Ok(Some(json)) => match parse_json::<SearchQuery>(&json) {
            Ok(query) => query,
            Err(error_ptr) => return error_ptr,
        },
        Ok(None) => SearchQuery::default(),
        Err(error_ptr) => return error_ptr,
    };

    response_to_c_string(&AppResponse::success(store.search(&query)))
}

/// Aggregate counts over the current record set.
///
/// # Returns
///
/// A JSON envelope with `total`, `verified`, `withBarcode`, `byCategory`,
/// `bySource`, `lastUpdated` and `unmigrated`. Release it with
/// [`free_response`].
///
/// # Errors
///
/// * `BadRequest` - null store pointer
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn store_stats(store: *mut SupplementStore) -> *const c_char {
    match store_ref(store, "store_stats") {
        Ok(store) => response_to_c_string(&AppResponse::success(store.stats())),
        Err(error_ptr) => error_ptr,
    }
}

/// Re-runs schema migration over the stored set. The response carries the
/// migrated count, per-record errors and the path of the backup taken first.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn run_migration(store: *mut SupplementStore) -> *const c_char {
    match store_ref(store, "run_migration") {
        Ok(store) => response_to_c_string(&AppResponse::from_result(store.migrate())),
        Err(error_ptr) => error_ptr,
    }
}

/// Syncs and releases the store. The pointer must not be used afterwards.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_store(store: *mut SupplementStore) -> *const c_char {
    if store.is_null() {
        let error: AppResponse<()> = AppResponse::bad_request("Null store pointer passed to close_store");
        return response_to_c_string(&error);
    }

    let store = unsafe { Box::from_raw(store) };
    let result = store.close().map(|()| "Store closed successfully");
    response_to_c_string(&AppResponse::from_result(result))
}

/// Releases a string returned by any other function of this library.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(response: *const c_char) {
    if response.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(response as *mut c_char));
    }
}

fn response_to_c_string<T: Serialize>(response: &AppResponse<T>) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

fn bad_request(message: String) -> *const c_char {
    let error: AppResponse<()> = AppResponse::bad_request(message);
    response_to_c_string(&error)
}

fn store_ref<'a>(store: *mut SupplementStore, fn_name: &str) -> Result<&'a SupplementStore, *const c_char> {
    match unsafe { store.as_ref() } {
        Some(store) => Ok(store),
        None => Err(bad_request(format!("Null store pointer passed to {fn_name}"))),
    }
}

fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        return Err(bad_request(format!("Null {field_name} pointer")));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => Err(bad_request(format!("Invalid UTF-8 in {field_name}: {e}"))),
    }
}

fn optional_c_str(ptr: *const c_char, field_name: &str) -> Result<Option<String>, *const c_char> {
    if ptr.is_null() {
        return Ok(None);
    }
    c_ptr_to_string(ptr, field_name).map(Some)
}

fn parse_json<T: DeserializeOwned>(json: &str) -> Result<T, *const c_char> {
    serde_json::from_str(json).map_err(|e| {
        let error: AppResponse<()> = AppResponse::from(e);
        response_to_c_string(&error)
    })
}

/// Parses and schema-checks a candidate, reporting every offending field.
fn parse_candidate(json: &str) -> Result<CandidateRecord, *const c_char> {
    let value: Value = parse_json(json)?;
    schema::parse_candidate(&value).map_err(|e| {
        let error: AppResponse<()> = AppResponse::from(StoreError::from(e));
        response_to_c_string(&error)
    })
}
