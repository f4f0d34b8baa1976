//! Windows backend: Windows Filtering Platform.
//!
//! All filters live in one provider-owned sublayer. A rule set is installed
//! inside a single WFP transaction: the previous filters are deleted and the
//! new ones added, then the transaction commits or aborts as a whole.
//!
//! Filter keys are derived from a base GUID and a running index, so filters
//! left behind by a previous instance (persistent ones survive restarts) can
//! be found and deleted without enumeration.

use super::rules::{Action, Band, Direction, Protocol, Rule, RuleSet};
use super::FirewallBackend;
use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use ipnet::IpNet;
use std::sync::Mutex;
use vpnd_common::net::Family;
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;

/// Sublayer weight; stays below the split-tunnel driver's sublayer.
pub const SUBLAYER_WEIGHT: u16 = 0xFFF0;

const RPC_C_AUTHN_WINNT: u32 = 10;
const FWP_E_FILTER_NOT_FOUND: u32 = 0x8032_0003;
const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;

const PROVIDER_KEY: GUID = GUID::from_u128(0x1b1c7a3e_56f0_4a57_9f43_7670_6e64_0001);
const SUBLAYER_KEY: GUID = GUID::from_u128(0x1b1c7a3e_56f0_4a57_9f43_7670_6e64_0002);
const FIREWALL_FILTER_BASE: u128 = 0x1b1c7a3e_56f0_4a57_9f43_7670_6e64_1000;
const DNS_FILTER_BASE: u128 = 0x1b1c7a3e_56f0_4a57_9f43_7670_6e64_2000;
const MAX_FILTERS: u128 = 0x0fff;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

struct Engine(HANDLE);

// The engine handle is only used under the backend mutex.
unsafe impl Send for Engine {}

impl Drop for Engine {
    fn drop(&mut self) {
        unsafe {
            let _ = FwpmEngineClose0(self.0);
        }
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn check(call: &str, status: u32) -> VpnResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(VpnError::tool_failed("wfp", Some(status as i32), format!("{} failed: 0x{:08X}", call, status)))
    }
}

fn filter_key(base: u128, index: usize) -> GUID {
    GUID::from_u128(base + index as u128)
}

fn band_weight(band: Band) -> u8 {
    match band {
        Band::Base => 14,
        Band::Prioritized => 12,
        Band::DnsBlock => 10,
        Band::Tunnel => 8,
        Band::Exceptions => 6,
        Band::IcmpOnly => 4,
        Band::DefaultBlock => 0,
    }
}

pub struct WfpBackend {
    engine: Mutex<Engine>,
}

impl WfpBackend {
    /// Open a WFP session and register provider and sublayer.
    pub fn open() -> VpnResult<Self> {
        let mut handle = HANDLE::default();
        let status = unsafe { FwpmEngineOpen0(PCWSTR::null(), RPC_C_AUTHN_WINNT, None, None, &mut handle) };
        check("FwpmEngineOpen0", status)?;
        let engine = Engine(handle);

        let mut name = wide("vpnd");
        let mut description = wide("vpnd kill-switch");
        let provider = FWPM_PROVIDER0 {
            providerKey: PROVIDER_KEY,
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR(description.as_mut_ptr()),
            },
            flags: FWPM_PROVIDER_FLAG_PERSISTENT,
            ..Default::default()
        };
        let status = unsafe { FwpmProviderAdd0(engine.0, &provider, None) };
        if status != FWP_E_ALREADY_EXISTS {
            check("FwpmProviderAdd0", status)?;
        }

        let mut provider_key = PROVIDER_KEY;
        let sublayer = FWPM_SUBLAYER0 {
            subLayerKey: SUBLAYER_KEY,
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR(description.as_mut_ptr()),
            },
            flags: FWPM_SUBLAYER_FLAG_PERSISTENT,
            providerKey: &mut provider_key,
            weight: SUBLAYER_WEIGHT,
            ..Default::default()
        };
        let status = unsafe { FwpmSubLayerAdd0(engine.0, &sublayer, None) };
        if status != FWP_E_ALREADY_EXISTS {
            check("FwpmSubLayerAdd0", status)?;
        }

        Ok(Self {
            engine: Mutex::new(engine),
        })
    }

    fn with_transaction<F>(&self, body: F) -> VpnResult<()>
    where
        F: FnOnce(HANDLE) -> VpnResult<()>,
    {
        let engine = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        check("FwpmTransactionBegin0", unsafe { FwpmTransactionBegin0(engine.0, 0) })?;
        match body(engine.0) {
            Ok(()) => check("FwpmTransactionCommit0", unsafe { FwpmTransactionCommit0(engine.0) }),
            Err(e) => {
                unsafe {
                    let _ = FwpmTransactionAbort0(engine.0);
                }
                Err(e)
            }
        }
    }

    fn filter_exists(&self, key: &GUID) -> bool {
        let engine = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        let mut filter: *mut FWPM_FILTER0 = std::ptr::null_mut();
        let status = unsafe { FwpmFilterGetByKey0(engine.0, key, &mut filter) };
        if status == 0 {
            unsafe { FwpmFreeMemory0(&mut filter as *mut _ as *mut *mut core::ffi::c_void) };
            true
        } else {
            false
        }
    }
}

/// Delete `base + 0..` until a key is missing.
fn delete_filters(engine: HANDLE, base: u128) -> VpnResult<()> {
    for index in 0..MAX_FILTERS as usize {
        let key = filter_key(base, index);
        let status = unsafe { FwpmFilterDeleteByKey0(engine, &key) };
        if status == FWP_E_FILTER_NOT_FOUND {
            return Ok(());
        }
        check("FwpmFilterDeleteByKey0", status)?;
    }
    Ok(())
}

/// Owned storage for one filter's conditions.
#[derive(Default)]
struct Conditions {
    list: Vec<FWPM_FILTER_CONDITION0>,
    v4: Vec<Box<FWP_V4_ADDR_AND_MASK>>,
    v6: Vec<Box<FWP_V6_ADDR_AND_MASK>>,
    app_ids: Vec<*mut FWP_BYTE_BLOB>,
}

impl Drop for Conditions {
    fn drop(&mut self) {
        for blob in self.app_ids.iter_mut() {
            unsafe { FwpmFreeMemory0(blob as *mut _ as *mut *mut core::ffi::c_void) };
        }
    }
}

impl Conditions {
    fn address(&mut self, field: GUID, net: &IpNet) {
        let mut value = FWP_CONDITION_VALUE0::default();
        match net {
            IpNet::V4(n) => {
                let mut mask = Box::new(FWP_V4_ADDR_AND_MASK {
                    addr: u32::from(n.addr()),
                    mask: u32::from(n.netmask()),
                });
                value.r#type = FWP_V4_ADDR_MASK;
                value.Anonymous.v4AddrMask = &mut *mask;
                self.v4.push(mask);
            }
            IpNet::V6(n) => {
                let mut mask = Box::new(FWP_V6_ADDR_AND_MASK {
                    addr: n.addr().octets(),
                    prefixLength: n.prefix_len(),
                });
                value.r#type = FWP_V6_ADDR_MASK;
                value.Anonymous.v6AddrMask = &mut *mask;
                self.v6.push(mask);
            }
        }
        self.push(field, value);
    }

    fn protocol(&mut self, proto: u8) {
        let mut value = FWP_CONDITION_VALUE0 {
            r#type: FWP_UINT8,
            ..Default::default()
        };
        value.Anonymous.uint8 = proto;
        self.push(FWPM_CONDITION_IP_PROTOCOL, value);
    }

    fn port(&mut self, field: GUID, port: u16) {
        let mut value = FWP_CONDITION_VALUE0 {
            r#type: FWP_UINT16,
            ..Default::default()
        };
        value.Anonymous.uint16 = port;
        self.push(field, value);
    }

    fn application(&mut self, path: &std::path::Path) -> VpnResult<()> {
        let name = wide(&path.to_string_lossy());
        let mut blob: *mut FWP_BYTE_BLOB = std::ptr::null_mut();
        let status = unsafe { FwpmGetAppIdFromFileName0(PCWSTR(name.as_ptr()), &mut blob) };
        check("FwpmGetAppIdFromFileName0", status)?;
        self.app_ids.push(blob);
        let mut value = FWP_CONDITION_VALUE0 {
            r#type: FWP_BYTE_BLOB_TYPE,
            ..Default::default()
        };
        value.Anonymous.byteBlob = blob;
        self.push(FWPM_CONDITION_ALE_APP_ID, value);
        Ok(())
    }

    fn push(&mut self, field: GUID, value: FWP_CONDITION_VALUE0) {
        self.list.push(FWPM_FILTER_CONDITION0 {
            fieldKey: field,
            matchType: FWP_MATCH_EQUAL,
            conditionValue: value,
        });
    }
}

fn layers(direction: Direction, family: Family) -> Vec<GUID> {
    let (out, inbound) = match family {
        Family::V4 => (FWPM_LAYER_ALE_AUTH_CONNECT_V4, FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4),
        Family::V6 => (FWPM_LAYER_ALE_AUTH_CONNECT_V6, FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6),
    };
    match direction {
        Direction::Out => vec![out],
        Direction::In => vec![inbound],
        Direction::Both => vec![out, inbound],
    }
}

struct FilterWriter {
    engine: HANDLE,
    base: u128,
    next: usize,
    flags: FWPM_FILTER_FLAGS,
}

impl FilterWriter {
    fn add_rule(&mut self, rule: &Rule) -> VpnResult<()> {
        let families = match rule.effective_family() {
            Some(f) => vec![f],
            None => vec![Family::V4, Family::V6],
        };
        for family in families {
            for layer in layers(rule.direction, family) {
                let inbound = layer == FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4 || layer == FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6;
                self.add(rule, family, layer, inbound, self.flags)?;
                if rule.band == Band::DefaultBlock && self.flags.0 & FWPM_FILTER_FLAG_PERSISTENT.0 != 0 {
                    // Second copy active from boot until the service starts.
                    self.add(rule, family, layer, inbound, FWPM_FILTER_FLAG_BOOTTIME)?;
                }
            }
        }
        Ok(())
    }

    fn add(&mut self, rule: &Rule, family: Family, layer: GUID, inbound: bool, flags: FWPM_FILTER_FLAGS) -> VpnResult<()> {
        let mut conds = Conditions::default();
        // Local/remote are the same fields on both ALE layers.
        if let Some(net) = &rule.remote {
            conds.address(FWPM_CONDITION_IP_REMOTE_ADDRESS, net);
        }
        if let Some(net) = &rule.local {
            conds.address(FWPM_CONDITION_IP_LOCAL_ADDRESS, net);
        }
        match rule.protocol {
            Protocol::Any => {}
            Protocol::Tcp => conds.protocol(IPPROTO_TCP),
            Protocol::Udp => conds.protocol(IPPROTO_UDP),
            Protocol::Icmp if family == Family::V4 => conds.protocol(IPPROTO_ICMP),
            Protocol::Icmp => conds.protocol(IPPROTO_ICMPV6),
        }
        if let Some(p) = rule.local_port {
            conds.port(FWPM_CONDITION_IP_LOCAL_PORT, p);
        }
        if let Some(p) = rule.remote_port {
            conds.port(FWPM_CONDITION_IP_REMOTE_PORT, p);
        }
        if let Some(app) = &rule.application {
            if let Err(e) = conds.application(app) {
                log::warn!("Skipping application rule for {}: {}", app.display(), e);
                return Ok(());
            }
        }

        let mut name = wide(&format!("vpnd {}{}", rule.tag, if inbound { " in" } else { "" }));
        let mut provider_key = PROVIDER_KEY;
        let mut filter = FWPM_FILTER0 {
            filterKey: filter_key(self.base, self.next),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR::null(),
            },
            flags,
            providerKey: &mut provider_key,
            layerKey: layer,
            subLayerKey: SUBLAYER_KEY,
            numFilterConditions: conds.list.len() as u32,
            filterCondition: if conds.list.is_empty() {
                std::ptr::null_mut()
            } else {
                conds.list.as_mut_ptr()
            },
            ..Default::default()
        };
        filter.weight.r#type = FWP_UINT8;
        filter.weight.Anonymous.uint8 = band_weight(rule.band);
        filter.action.r#type = match rule.action {
            Action::Allow => FWP_ACTION_PERMIT,
            Action::Block => FWP_ACTION_BLOCK,
        };

        let status = unsafe { FwpmFilterAdd0(self.engine, &filter, None, None) };
        check("FwpmFilterAdd0", status)?;
        self.next += 1;
        Ok(())
    }
}

fn install(engine: HANDLE, base: u128, rules: &RuleSet) -> VpnResult<()> {
    delete_filters(engine, base)?;
    let mut writer = FilterWriter {
        engine,
        base,
        next: 0,
        flags: if rules.persistent {
            FWPM_FILTER_FLAG_PERSISTENT
        } else {
            FWPM_FILTER_FLAG_NONE
        },
    };
    for rule in rules.ordered() {
        writer.add_rule(rule)?;
    }
    log::debug!("WFP: {} filters installed", writer.next);
    Ok(())
}

#[async_trait]
impl FirewallBackend for WfpBackend {
    fn name(&self) -> &'static str {
        "wfp"
    }

    async fn apply(&self, rules: &RuleSet) -> VpnResult<()> {
        self.with_transaction(|engine| install(engine, FIREWALL_FILTER_BASE, rules))
    }

    async fn remove(&self) -> VpnResult<()> {
        self.with_transaction(|engine| delete_filters(engine, FIREWALL_FILTER_BASE))
    }

    async fn is_installed(&self) -> VpnResult<bool> {
        Ok(self.filter_exists(&filter_key(FIREWALL_FILTER_BASE, 0)))
    }

    async fn set_single_dns_rule(&self, rules: Option<&RuleSet>) -> VpnResult<()> {
        match rules {
            Some(rules) => self.with_transaction(|engine| install(engine, DNS_FILTER_BASE, rules)),
            None => self.with_transaction(|engine| delete_filters(engine, DNS_FILTER_BASE)),
        }
    }

    fn supports_application_rules(&self) -> bool {
        true
    }
}
