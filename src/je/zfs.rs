// SPDX-License-Identifier: MPL-2.0

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::ffi::{CStr, CString, OsStr, c_char, c_int, c_void};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::ptr;
use std::sync::{LazyLock, Mutex, MutexGuard};

use super::{Backend, DatasetName, Datasets, Error};

/// The zfs(8) utility, used where libzfs has no stable interface.
const ZFS_COMMAND: &str = "/sbin/zfs";

/// The `source` libzfs reports for a property value that was received.
const RECEIVED_SOURCE: &str = "$recvd";

/// A storage backend backed by libzfs.
pub struct LibZfsBackend;

impl LibZfsBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LibZfsBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate "no such dataset" into [`Error::NotFound`] for `name`.
fn or_not_found(name: &DatasetName) -> impl FnOnce(Error) -> Error + '_ {
    move |err| match err {
        Error::LibzfsError(LibzfsError {
            errno: ffi::EZFS_NOENT,
            ..
        }) => Error::not_found(name.as_str()),
        other => other,
    }
}

/// Translate "dataset exists" into [`Error::AlreadyExists`] for `name`.
fn or_already_exists(name: &DatasetName) -> impl FnOnce(Error) -> Error + '_ {
    move |err| match err {
        Error::LibzfsError(LibzfsError {
            errno: ffi::EZFS_EEXIST,
            ..
        }) => Error::already_exists(name.as_str()),
        other => other,
    }
}

impl Backend for LibZfsBackend {
    fn exists(&self, name: &DatasetName) -> Result<bool, Error> {
        let lzh = LibHandle::get();
        let c_name = to_cstring(name)?;
        let types = ffi::ZFS_TYPE_FILESYSTEM | ffi::ZFS_TYPE_SNAPSHOT;
        Ok(unsafe { ffi::zfs_dataset_exists(lzh.as_ptr(), c_name.as_ptr(), types) } != 0)
    }

    fn create(&self, name: &DatasetName, properties: &[(&str, &str)]) -> Result<(), Error> {
        let props = NvList::from(properties)?;
        let lzh = LibHandle::get();
        Dataset::create(&lzh, name, &props).map_err(or_already_exists(name))
    }

    fn snapshot(&self, snapshot: &DatasetName) -> Result<(), Error> {
        let lzh = LibHandle::get();
        Dataset::create_snapshot(&lzh, snapshot).map_err(or_already_exists(snapshot))
    }

    fn clone_snapshot(&self, snapshot: &DatasetName, target: &DatasetName) -> Result<(), Error> {
        let lzh = LibHandle::get();
        let origin = Dataset::snapshot(&lzh, snapshot).map_err(or_not_found(snapshot))?;
        origin
            .clone(&lzh, target)
            .map_err(or_already_exists(target))
    }

    fn rename(&self, name: &DatasetName, new_name: &DatasetName) -> Result<(), Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        dataset
            .rename(&lzh, new_name, ffi::RenameFlags::default())
            .map_err(or_already_exists(new_name))
    }

    fn destroy(&self, name: &DatasetName, recursive: bool) -> Result<(), Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::open(&lzh, name, ffi::ZFS_TYPE_FILESYSTEM | ffi::ZFS_TYPE_SNAPSHOT)
            .map_err(or_not_found(name))?;
        if recursive {
            // Children and snapshots go first, deepest first.
            let mut beneath = Vec::new();
            dataset.collect_tree(&lzh, &mut beneath)?;
            for child in beneath.iter().rev() {
                Dataset::open(&lzh, child, ffi::ZFS_TYPE_FILESYSTEM | ffi::ZFS_TYPE_SNAPSHOT)?
                    .destroy(&lzh)?;
            }
        }
        dataset.destroy(&lzh)
    }

    fn user_properties(&self, name: &DatasetName) -> Result<Vec<(String, String)>, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        Ok(dataset.get_own_user_properties())
    }

    fn user_property(&self, name: &DatasetName, key: &str) -> Result<Option<String>, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        Ok(dataset
            .get_own_user_properties()
            .into_iter()
            .find(|(prop, _)| prop == key)
            .map(|(_, value)| value))
    }

    fn set_properties(
        &self,
        name: &DatasetName,
        properties: &[(&str, &str)],
    ) -> Result<(), Error> {
        let props = NvList::from(properties)?;
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        dataset.set_properties(&lzh, &props)
    }

    fn children(&self, name: &DatasetName) -> Result<Datasets, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        let mut children = Vec::new();
        dataset.iter_filesystems(&lzh, |child| {
            if let Some(name) = child.get_name() {
                children.push(name);
            }
            Ok(())
        })?;
        children.sort();
        Ok(children.into_iter())
    }

    fn descendants(&self, name: &DatasetName) -> Result<Datasets, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        let mut descendants = Vec::new();
        dataset.collect_filesystems(&lzh, &mut descendants)?;
        Ok(descendants.into_iter())
    }

    fn mountpoint(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        if dataset.get_canmount().as_deref() == Some("off") {
            return Ok(None);
        }
        Ok(match dataset.get_mountpoint_property() {
            Some(mountpoint) if mountpoint.starts_with('/') => Some(PathBuf::from(mountpoint)),
            // "none", "legacy" or unreadable.
            _ => None,
        })
    }

    fn mounted(&self, name: &DatasetName) -> Result<Option<PathBuf>, Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        Ok(dataset.get_mountpoint())
    }

    fn mount(&self, name: &DatasetName) -> Result<(), Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        dataset.mount(&lzh)
    }

    fn unmount_all(&self, name: &DatasetName, force: bool) -> Result<(), Error> {
        let lzh = LibHandle::get();
        let dataset = Dataset::filesystem(&lzh, name).map_err(or_not_found(name))?;
        if dataset.get_mountpoint().is_none() {
            return Ok(());
        }
        dataset.unmount_all(&lzh, force).map_err(|err| match err {
            Error::LibzfsError(LibzfsError {
                errno: ffi::EZFS_BUSY,
                ..
            }) => Error::busy(name),
            other => other,
        })
    }

    fn receive(&self, name: &DatasetName, stream: &mut dyn Read) -> Result<(), Error> {
        // zfs_receive() takes a struct of flags whose layout differs between
        // OpenZFS releases, so let zfs(8) do it.
        let mut child = Command::new(ZFS_COMMAND)
            .args(["receive", "-u", name.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            match io::copy(stream, &mut stdin) {
                Ok(bytes) => tracing::debug!(dataset = %name, bytes, "sent replication stream"),
                // zfs(8) exited early; its status says why.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => return Err(err.into()),
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::ReceiveFailed {
                name: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn list(&self, roots: &[DatasetName], out: &mut dyn Write) -> Result<(), Error> {
        let output = Command::new(ZFS_COMMAND)
            .args(["list", "-r"])
            .args(roots.iter().map(DatasetName::as_str))
            .output()?;
        if !output.status.success() {
            return Err(Error::backend(format!(
                "zfs list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        out.write_all(&output.stdout)?;
        Ok(())
    }
}

/// Convert a dataset name for use with libzfs.
fn to_cstring(name: &DatasetName) -> Result<CString, Error> {
    CString::new(name.as_str()).map_err(|_| Error::InvalidName {
        name: name.to_string(),
        reason: "contains a NUL byte".to_string(),
    })
}

/// Safe wrapper for various operations on a ZFS dataset handle.
struct Dataset {
    handle: *mut ffi::ZfsHandle,
    owns_handle: bool,
}

impl Dataset {
    /// Open a ZFS dataset with the given name and type.
    pub fn open(lzh: &LibHandle, name: &DatasetName, zfs_type: c_int) -> Result<Self, Error> {
        let c_name = to_cstring(name)?;
        let handle = unsafe { ffi::zfs_open(lzh.as_ptr(), c_name.as_ptr(), zfs_type) };
        if handle.is_null() {
            return Err(lzh.libzfs_error().into());
        }
        Ok(Dataset {
            handle,
            owns_handle: true,
        })
    }

    // Open a filesystem dataset.
    pub fn filesystem(lzh: &LibHandle, name: &DatasetName) -> Result<Self, Error> {
        Dataset::open(lzh, name, ffi::ZFS_TYPE_FILESYSTEM)
    }

    // Open a snapshot dataset.
    pub fn snapshot(lzh: &LibHandle, name: &DatasetName) -> Result<Self, Error> {
        Dataset::open(lzh, name, ffi::ZFS_TYPE_SNAPSHOT)
    }

    /// Create a Dataset from an existing handle. Closing the handle is the
    /// responsibility of the caller.
    pub fn borrowed(handle: *mut ffi::ZfsHandle) -> Self {
        Dataset {
            handle,
            owns_handle: false,
        }
    }

    /// Create a new ZFS filesystem.
    pub fn create(lzh: &LibHandle, name: &DatasetName, properties: &NvList) -> Result<(), Error> {
        let c_name = to_cstring(name)?;
        let result = unsafe {
            ffi::zfs_create(
                lzh.as_ptr(),
                c_name.as_ptr(),
                ffi::ZFS_TYPE_FILESYSTEM,
                properties.as_nvlist_ptr(),
            )
        };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Create a (non-recursive) snapshot of a dataset.
    pub fn create_snapshot(lzh: &LibHandle, snapshot_path: &DatasetName) -> Result<(), Error> {
        let c_name = to_cstring(snapshot_path)?;
        let result = unsafe { ffi::zfs_snapshot(lzh.as_ptr(), c_name.as_ptr(), 0, ptr::null_mut()) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Get the dataset name.
    pub fn get_name(&self) -> Option<DatasetName> {
        let name_ptr = unsafe { ffi::zfs_get_name(self.handle) };
        if name_ptr.is_null() {
            // The libzfs API claims this is not possible.
            return None;
        }
        let cstr = unsafe { CStr::from_ptr(name_ptr) };
        DatasetName::new(&cstr.to_string_lossy()).ok()
    }

    /// Get the dataset's current mountpoint if it is mounted.
    pub fn get_mountpoint(&self) -> Option<PathBuf> {
        let mut mountpoint_ptr: *mut c_char = ptr::null_mut();
        let result = unsafe { ffi::zfs_is_mounted(self.handle, &mut mountpoint_ptr) };
        if mountpoint_ptr.is_null() {
            return None;
        }
        let path = {
            let cstr = unsafe { CStr::from_ptr(mountpoint_ptr) };
            Path::new(OsStr::from_bytes(cstr.to_bytes())).to_path_buf()
        };
        // The mountpoint string is allocated for the caller.
        unsafe { libc::free(mountpoint_ptr as *mut c_void) };
        if result != 0 { Some(path) } else { None }
    }

    // Rename this dataset.
    pub fn rename(
        &self,
        lzh: &LibHandle,
        new_name: &DatasetName,
        flags: ffi::RenameFlags,
    ) -> Result<(), Error> {
        let c_name = to_cstring(new_name)?;
        let result = unsafe { ffi::zfs_rename(self.handle, c_name.as_ptr(), flags) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Destroy this dataset.
    pub fn destroy(&self, lzh: &LibHandle) -> Result<(), Error> {
        let result = unsafe { ffi::zfs_destroy(self.handle, 0) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Mount this dataset at its mountpoint property.
    pub fn mount(&self, lzh: &LibHandle) -> Result<(), Error> {
        let result = unsafe { ffi::zfs_mount(self.handle, ptr::null(), 0) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Unmount this dataset and every filesystem mounted beneath it.
    pub fn unmount_all(&self, lzh: &LibHandle, force: bool) -> Result<(), Error> {
        let flags = if force { libc::MNT_FORCE } else { 0 };
        let result = unsafe { ffi::zfs_unmountall(self.handle, flags as c_int) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Iterate over child filesystems.
    pub fn iter_filesystems<F>(&self, lzh: &LibHandle, callback: F) -> Result<(), Error>
    where
        F: FnMut(&Dataset) -> Result<(), Error>,
    {
        let mut data = IterData::from(callback);
        let result =
            unsafe { ffi::zfs_iter_filesystems(self.handle, iter_callback::<F>, data.as_mut_ptr()) };

        // Check if the callback set an error.
        if let Some(error) = data.error {
            return Err(error);
        }

        // Check for iteration failures.
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }

        Ok(())
    }

    /// Iterate over child filesystems and snapshots.
    pub fn iter_children<F>(&self, lzh: &LibHandle, callback: F) -> Result<(), Error>
    where
        F: FnMut(&Dataset) -> Result<(), Error>,
    {
        let mut data = IterData::from(callback);
        let result =
            unsafe { ffi::zfs_iter_children(self.handle, iter_callback::<F>, data.as_mut_ptr()) };

        if let Some(error) = data.error {
            return Err(error);
        }
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }

        Ok(())
    }

    /// Collect every filesystem beneath this one, parents first.
    fn collect_filesystems(&self, lzh: &LibHandle, out: &mut Vec<DatasetName>) -> Result<(), Error> {
        self.iter_filesystems(lzh, |child| {
            if let Some(name) = child.get_name() {
                out.push(name);
            }
            child.collect_filesystems(lzh, out)
        })
    }

    /// Collect every filesystem and snapshot beneath this one, parents first.
    fn collect_tree(&self, lzh: &LibHandle, out: &mut Vec<DatasetName>) -> Result<(), Error> {
        self.iter_children(lzh, |child| {
            if let Some(name) = child.get_name() {
                out.push(name);
            }
            child.collect_tree(lzh, out)
        })
    }

    /// Get the canmount property of this dataset.
    pub fn get_canmount(&self) -> Option<String> {
        self.get_property(ffi::ZFS_PROP_CANMOUNT)
    }

    /// Get the mountpoint property of this dataset.
    pub fn get_mountpoint_property(&self) -> Option<String> {
        self.get_property(ffi::ZFS_PROP_MOUNTPOINT)
    }

    /// Get a ZFS property for this dataset.
    fn get_property(&self, prop: c_int) -> Option<String> {
        const PROP_BUF_SIZE: usize = 1024;
        let mut buf = vec![0u8; PROP_BUF_SIZE];
        let result = unsafe {
            ffi::zfs_prop_get(
                self.handle,
                prop,
                buf.as_mut_ptr() as *mut c_char,
                PROP_BUF_SIZE,
                ptr::null_mut(),
                0,
            )
        };
        if result == 0 {
            if let Some(null_pos) = buf.iter().position(|&x| x == 0) {
                buf.truncate(null_pos);
            }
            String::from_utf8(buf).ok()
        } else {
            None
        }
    }

    /// Get the user properties set on or received by this dataset, raw.
    /// Values inherited from an ancestor are left out.
    fn get_own_user_properties(&self) -> Vec<(String, String)> {
        let mut properties = Vec::new();
        let user_props = unsafe { ffi::zfs_get_user_props(self.handle) };
        if user_props.is_null() {
            // This should never happen.
            return properties;
        }
        let own_name = self.get_name();

        // User properties are stored as an nvlist of nvlists, each holding
        // a "value" and its "source": the dataset it was set on, or
        // `$recvd` for a value that arrived with `zfs receive`.
        let mut pair = unsafe { ffi::nvlist_next_nvpair(user_props, ptr::null_mut()) };
        while !pair.is_null() {
            let key = unsafe { CStr::from_ptr(ffi::nvpair_name(pair)) }
                .to_string_lossy()
                .to_string();
            let mut prop_nvlist_ptr: *mut ffi::NvList = ptr::null_mut();
            if unsafe { ffi::nvpair_value_nvlist(pair, &mut prop_nvlist_ptr) } == 0
                && !prop_nvlist_ptr.is_null()
            {
                let value = lookup_string(prop_nvlist_ptr, c"value");
                let source = lookup_string(prop_nvlist_ptr, c"source");
                let inherited =
                    is_inherited(source.as_deref(), own_name.as_ref().map(DatasetName::as_str));
                if let (Some(value), false) = (value, inherited) {
                    properties.push((key, value));
                }
            }
            pair = unsafe { ffi::nvlist_next_nvpair(user_props, pair) };
        }
        properties
    }

    /// Set several ZFS properties on this dataset at once.
    fn set_properties(&self, lzh: &LibHandle, properties: &NvList) -> Result<(), Error> {
        let result = unsafe { ffi::zfs_prop_set_list(self.handle, properties.as_nvlist_ptr()) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }

    /// Clone a dataset from this snapshot.
    pub fn clone(&self, lzh: &LibHandle, name: &DatasetName) -> Result<(), Error> {
        let c_name = to_cstring(name)?;
        let result = unsafe { ffi::zfs_clone(self.handle, c_name.as_ptr(), ptr::null_mut()) };
        if result != 0 {
            return Err(lzh.libzfs_error().into());
        }
        Ok(())
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if !self.owns_handle || self.handle.is_null() {
            return;
        }
        unsafe {
            ffi::zfs_close(self.handle);
        }
    }
}

/// Look up a string entry of an nvlist.
/// Whether a user property `source` names a dataset other than `own`.
fn is_inherited(source: Option<&str>, own: Option<&str>) -> bool {
    match (source, own) {
        (Some(source), Some(own)) => source != own && source != RECEIVED_SOURCE,
        _ => false,
    }
}

fn lookup_string(nvl: *mut ffi::NvList, name: &CStr) -> Option<String> {
    let mut value_ptr: *mut c_char = ptr::null_mut();
    let result = unsafe { ffi::nvlist_lookup_string(nvl, name.as_ptr(), &mut value_ptr) };
    if result != 0 || value_ptr.is_null() {
        return None;
    }
    let cstr = unsafe { CStr::from_ptr(value_ptr) };
    Some(cstr.to_string_lossy().to_string())
}

/// Helper struct to pass both a closure and error state to libzfs iterator
/// callbacks.
struct IterData<F> {
    callback: F,
    error: Option<Error>,
}

impl<F> IterData<F>
where
    F: FnMut(&Dataset) -> Result<(), Error>,
{
    pub fn from(callback: F) -> Self {
        IterData {
            callback,
            error: None,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self as *mut IterData<F> as *mut c_void
    }
}

/// C-style callback that can be passed to libzfs iterator functions. The
/// handle is closed here once the closure is done with it.
///
/// SAFETY: This function assumes that the data is valid IterData.
extern "C" fn iter_callback<F>(zhp: *mut ffi::ZfsHandle, data: *mut c_void) -> c_int
where
    F: FnMut(&Dataset) -> Result<(), Error>,
{
    let iter_data = unsafe { &mut *(data as *mut IterData<F>) };
    let dataset = Dataset::borrowed(zhp);

    let result = match (iter_data.callback)(&dataset) {
        Ok(()) => 0, // Continue iteration
        Err(e) => {
            iter_data.error = Some(e);
            1 // Stop iteration
        }
    };
    unsafe { ffi::zfs_close(zhp) };
    result
}

// Wraps the libzfs handle to manage its lifetime.
struct LibHandle {
    handle: ptr::NonNull<ffi::LibzfsHandle>,
}

impl LibHandle {
    /// Get a guarded reference to the underlying `libzfs` handle.
    ///
    /// ## Deadlocks
    ///
    /// Calling this again before the guard is dropped deadlocks; backend
    /// methods take the handle once and pass it down.
    ///
    /// ## Panics
    ///
    /// Panics if `libzfs` cannot be initialized or if the lock is poisoned.
    pub fn get() -> MutexGuard<'static, Self> {
        static LZH: LazyLock<Mutex<LibHandle>> = LazyLock::new(|| {
            let handle = unsafe { ffi::libzfs_init() };
            if handle.is_null() {
                panic!("Failed to initialize libzfs");
            }
            Mutex::new(LibHandle {
                handle: unsafe { ptr::NonNull::new_unchecked(handle) },
            })
        });
        LZH.lock().expect("Failed to acquire libzfs handle")
    }

    /// Get the current libzfs error.
    pub fn libzfs_error(&self) -> LibzfsError {
        let errno = unsafe { ffi::libzfs_errno(self.handle.as_ptr()) };
        let desc_ptr = unsafe { ffi::libzfs_error_description(self.handle.as_ptr()) };
        let description = if desc_ptr.is_null() {
            // This should never happen (tm).
            "unknown".to_string()
        } else {
            let cstr = unsafe { CStr::from_ptr(desc_ptr) };
            cstr.to_string_lossy().to_string()
        };
        LibzfsError { errno, description }
    }

    // Get the underlying libzfs handle as a raw pointer.
    pub fn as_ptr(&self) -> *mut ffi::LibzfsHandle {
        self.handle.as_ptr()
    }
}

impl Drop for LibHandle {
    fn drop(&mut self) {
        // Never called when accessing the handle through the LazyLock.
        unsafe {
            ffi::libzfs_fini(self.handle.as_ptr());
        }
    }
}

// SAFETY: Since we have complete control over the lifetime of the underlying
// libzfs handle and serialize access to it, it is safe to send LibHandle
// across threads.
unsafe impl Send for LibHandle {}

/// Surfaces errors from the underlying libzfs library.
#[derive(Debug)]
pub struct LibzfsError {
    pub errno: i32,
    pub description: String,
}

impl std::fmt::Display for LibzfsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for LibzfsError {}

/// Wraps an nvlist to manage its lifetime.
struct NvList {
    nvl: *mut ffi::NvList,
}

impl NvList {
    pub fn new() -> Result<Self, Error> {
        let mut nvl: *mut ffi::NvList = ptr::null_mut();
        let result = unsafe { ffi::nvlist_alloc(&mut nvl, ffi::NV_UNIQUE_NAME, 0) };
        if result != 0 {
            return Err(io::Error::from_raw_os_error(result).into());
        }
        if nvl.is_null() {
            let err: io::Error = io::ErrorKind::OutOfMemory.into();
            return Err(err.into());
        }
        Ok(NvList { nvl })
    }

    pub fn from(pairs: &[(&str, &str)]) -> Result<Self, Error> {
        let mut nvl = Self::new()?;
        for (key, value) in pairs {
            nvl.add_string(key, value)?;
        }
        Ok(nvl)
    }

    pub fn add_string(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let name_cstr = CString::new(name).map_err(|_| Error::invalid_prop(name, value))?;
        let value_cstr = CString::new(value).map_err(|_| Error::invalid_prop(name, value))?;
        let result =
            unsafe { ffi::nvlist_add_string(self.nvl, name_cstr.as_ptr(), value_cstr.as_ptr()) };
        if result != 0 {
            return Err(io::Error::from_raw_os_error(result).into());
        }
        Ok(())
    }

    pub fn as_nvlist_ptr(&self) -> *mut ffi::NvList {
        self.nvl
    }
}

impl Drop for NvList {
    fn drop(&mut self) {
        unsafe { ffi::nvlist_free(self.nvl) };
    }
}


// libzfs FFI bindings
mod ffi {
    use std::os::raw::{c_char, c_int, c_uint, c_void};

    // Opaque handle types matching libzfs
    #[repr(C)]
    pub struct LibzfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct ZfsHandle {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct NvList {
        _opaque: [u8; 0],
    }

    #[repr(C)]
    pub struct NvPair {
        _opaque: [u8; 0],
    }

    // ZFS type constants from sys/fs/zfs.h
    pub const ZFS_TYPE_FILESYSTEM: c_int = 1 << 0;
    pub const ZFS_TYPE_SNAPSHOT: c_int = 1 << 1;

    // ZFS property constants from sys/fs/zfs.h
    pub const ZFS_PROP_MOUNTPOINT: c_int = 13;
    pub const ZFS_PROP_CANMOUNT: c_int = 28;

    // NvList constants
    pub const NV_UNIQUE_NAME: c_uint = 0x1;

    pub type ZfsProp = c_int;

    /// renameflags_t: three one-bit fields packed into an int.
    #[repr(transparent)]
    #[derive(Default)]
    pub struct RenameFlags(pub c_uint);

    // The subset of error codes in libzfs.h we pay special attention to.
    pub const EZFS_BUSY: c_int = 2007;
    pub const EZFS_EEXIST: c_int = 2008;
    pub const EZFS_NOENT: c_int = 2009;

    #[link(name = "zfs")]
    #[link(name = "nvpair")]
    unsafe extern "C" {
        // Library initialization
        pub fn libzfs_init() -> *mut LibzfsHandle;
        pub fn libzfs_fini(hdl: *mut LibzfsHandle);

        // Error handling
        pub fn libzfs_errno(hdl: *mut LibzfsHandle) -> c_int;
        pub fn libzfs_error_description(hdl: *mut LibzfsHandle) -> *const c_char;

        // Dataset handle management
        pub fn zfs_open(
            hdl: *mut LibzfsHandle,
            name: *const c_char,
            types: c_int,
        ) -> *mut ZfsHandle;
        pub fn zfs_close(zhp: *mut ZfsHandle);
        pub fn zfs_dataset_exists(
            hdl: *mut LibzfsHandle,
            path: *const c_char,
            types: c_int,
        ) -> c_int; // boolean_t

        // Dataset operations
        pub fn zfs_create(
            hdl: *mut LibzfsHandle,
            path: *const c_char,
            typ: c_int,
            props: *mut NvList,
        ) -> c_int;

        pub fn zfs_destroy(zhp: *mut ZfsHandle, defer: c_int) -> c_int;

        pub fn zfs_snapshot(
            hdl: *mut LibzfsHandle,
            path: *const c_char,
            recursive: c_int, // boolean_t
            props: *mut NvList,
        ) -> c_int;

        pub fn zfs_clone(zhp: *mut ZfsHandle, target: *const c_char, props: *mut NvList) -> c_int;

        // Mount operations
        pub fn zfs_mount(zhp: *mut ZfsHandle, options: *const c_char, flags: c_int) -> c_int;
        pub fn zfs_unmountall(zhp: *mut ZfsHandle, flags: c_int) -> c_int;
        pub fn zfs_is_mounted(zhp: *mut ZfsHandle, where_: *mut *mut c_char) -> c_int;

        // Rename operation
        pub fn zfs_rename(zhp: *mut ZfsHandle, target: *const c_char, flags: RenameFlags) -> c_int;

        // Iterator functions
        pub fn zfs_iter_children(
            zhp: *mut ZfsHandle,
            func: extern "C" fn(*mut ZfsHandle, *mut c_void) -> c_int,
            data: *mut c_void,
        ) -> c_int;

        pub fn zfs_iter_filesystems(
            zhp: *mut ZfsHandle,
            func: extern "C" fn(*mut ZfsHandle, *mut c_void) -> c_int,
            data: *mut c_void,
        ) -> c_int;

        // Property functions
        pub fn zfs_get_name(zhp: *mut ZfsHandle) -> *const c_char;
        pub fn zfs_prop_get(
            zhp: *mut ZfsHandle,
            prop: ZfsProp,
            buf: *mut c_char,
            len: usize,
            source: *mut c_int,
            literal: c_int,
        ) -> c_int;
        pub fn zfs_get_user_props(zhp: *mut ZfsHandle) -> *mut NvList;
        pub fn zfs_prop_set_list(zhp: *mut ZfsHandle, props: *mut NvList) -> c_int;

        // NvList functions for property management
        pub fn nvlist_alloc(nvlp: *mut *mut NvList, nvflag: c_uint, kmflag: c_int) -> c_int;
        pub fn nvlist_add_string(
            nvl: *mut NvList,
            name: *const c_char,
            val: *const c_char,
        ) -> c_int;
        pub fn nvlist_lookup_string(
            nvl: *mut NvList,
            name: *const c_char,
            val: *mut *mut c_char,
        ) -> c_int;
        pub fn nvlist_next_nvpair(nvl: *mut NvList, nvp: *mut NvPair) -> *mut NvPair;
        pub fn nvpair_name(nvp: *mut NvPair) -> *const c_char;
        pub fn nvpair_value_nvlist(nvp: *mut NvPair, val: *mut *mut NvList) -> c_int;
        pub fn nvlist_free(nvl: *mut NvList);
    }
}
