//! Device I/O control channel to the split-tunnel driver.

use super::driver::{encode_addresses, encode_apps, SplitDriver};
use super::ConfigAddresses;
use crate::error::{VpnError, VpnResult};
use std::ffi::c_void;
use std::sync::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_MODE, OPEN_EXISTING,
};
use windows::Win32::System::IO::DeviceIoControl;

const DEVICE_NAME: &str = r"\\.\IVPNSPLITTUNNEL";

const IOCTL_STOP_ALL_AND_CFG_CLEAN: u32 = 0x100;
const IOCTL_SPLITTING_START: u32 = 0x400;
const IOCTL_CFG_SET_ADDRESSES: u32 = 0x500;
const IOCTL_CFG_SET_IMAGES_TO_SPLIT: u32 = 0x600;

struct Device(HANDLE);

// Only used under the driver mutex.
unsafe impl Send for Device {}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

pub struct IoctlDriver {
    device: Mutex<Option<Device>>,
}

impl IoctlDriver {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(None),
        }
    }

    fn send(&self, code: u32, input: &[u8]) -> VpnResult<()> {
        let device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        let handle = device
            .as_ref()
            .ok_or_else(|| VpnError::internal("split-tunnel driver is not connected"))?
            .0;
        let mut returned = 0u32;
        let input_ptr = (!input.is_empty()).then(|| input.as_ptr() as *const c_void);
        let result = unsafe {
            DeviceIoControl(
                handle,
                code,
                input_ptr,
                input.len() as u32,
                None,
                0,
                Some(&mut returned),
                None,
            )
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(VpnError::tool_failed(
                "split-tunnel driver",
                Some(e.code().0),
                format!("IOCTL {:#x}: {}", code, e.message()),
            )),
        }
    }
}

impl Default for IoctlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitDriver for IoctlDriver {
    fn connect(&self) -> VpnResult<()> {
        let mut device = self.device.lock().unwrap_or_else(|e| e.into_inner());
        if device.is_some() {
            return Ok(());
        }
        let name: Vec<u16> = DEVICE_NAME.encode_utf16().chain(std::iter::once(0)).collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR(name.as_ptr()),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_MODE(0),
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                HANDLE::default(),
            )
        }
        .map_err(|e| {
            VpnError::not_available(format!("split-tunnel driver ({}; is the driver installed?)", e.message()))
        })?;
        *device = Some(Device(handle));
        log::info!("Split-tunnel driver connected");
        Ok(())
    }

    fn disconnect(&self) -> VpnResult<()> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn stop_and_clean(&self) -> VpnResult<()> {
        self.send(IOCTL_STOP_ALL_AND_CFG_CLEAN, &[])
    }

    fn set_addresses(&self, addrs: &ConfigAddresses) -> VpnResult<()> {
        self.send(IOCTL_CFG_SET_ADDRESSES, &encode_addresses(addrs))
    }

    fn set_apps(&self, paths: &[String]) -> VpnResult<()> {
        self.send(IOCTL_CFG_SET_IMAGES_TO_SPLIT, &encode_apps(paths))
    }

    fn start(&self) -> VpnResult<()> {
        self.send(IOCTL_SPLITTING_START, &[])
    }
}
