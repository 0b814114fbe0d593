//! CPU-level instructions used by virtualization probes.
//!
//! Only meaningful on x86_64; other targets get `None` from every query so the
//! probes built on top report Inconclusive rather than a false negative.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{__cpuid, _rdtsc};

use crate::config::types::Finding;

/// Value the VMware backdoor echoes in EBX
pub const VMWARE_BACKDOOR_MAGIC: u32 = 0x564D_5868;
/// I/O port of the VMware backdoor
pub const VMWARE_BACKDOOR_PORT: u16 = 0x5658;
/// Backdoor command: get version
pub const VMWARE_CMD_GET_VERSION: u32 = 10;

/// CPUID leaf carrying the hypervisor vendor signature
pub const HYPERVISOR_LEAF: u32 = 0x4000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[cfg(target_arch = "x86_64")]
pub fn cpuid(leaf: u32) -> Option<CpuidRegs> {
    // SAFETY: CPUID is available on every x86_64 processor.
    #[allow(unused_unsafe)]
    let r = unsafe { __cpuid(leaf) };
    Some(CpuidRegs {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    })
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cpuid(_leaf: u32) -> Option<CpuidRegs> {
    None
}

/// CPUID.1:ECX bit 31, set by hypervisors for their guests
pub fn hypervisor_bit() -> Option<bool> {
    cpuid(1).map(|regs| (regs.ecx >> 31) & 1 == 1)
}

/// Vendor signature from the hypervisor leaf (EBX, ECX, EDX), NULs trimmed
pub fn hypervisor_vendor() -> Option<String> {
    cpuid(HYPERVISOR_LEAF).map(|regs| vendor_string(regs.ebx, regs.ecx, regs.edx))
}

pub fn vendor_string(ebx: u32, ecx: u32, edx: u32) -> String {
    let bytes: Vec<u8> = [ebx, ecx, edx]
        .iter()
        .flat_map(|reg| reg.to_le_bytes())
        .collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// TSC cycles spent across a CPUID (a forced VM exit under hardware virtualization)
///
/// Signed: a TSC that runs backwards across the exit yields a negative delta.
#[cfg(target_arch = "x86_64")]
pub fn vmexit_cycles() -> Option<i64> {
    // SAFETY: RDTSC and CPUID are unprivileged unless TSC access was disabled with
    // prctl(PR_SET_TSC), which this crate never does.
    #[allow(unused_unsafe)]
    let (start, end) = unsafe {
        let start = _rdtsc();
        let _ = __cpuid(0);
        let end = _rdtsc();
        (start, end)
    };
    Some(end.wrapping_sub(start) as i64)
}

#[cfg(not(target_arch = "x86_64"))]
pub fn vmexit_cycles() -> Option<i64> {
    None
}

/// Issue the VMware backdoor GETVERSION call and return EBX
///
/// # Safety
/// Outside a VMware guest the `in` instruction raises a general protection
/// fault (SIGSEGV). Callers must run this under a fault boundary.
#[cfg(target_arch = "x86_64")]
pub unsafe fn vmware_backdoor_ebx() -> u32 {
    let ebx: u64;
    // rbx is reserved by LLVM; swap it through a scratch register.
    std::arch::asm!(
        "xchg {tmp}, rbx",
        "in eax, dx",
        "xchg {tmp}, rbx",
        tmp = inout(reg) u64::from(u32::MAX) => ebx,
        inout("eax") VMWARE_BACKDOOR_MAGIC => _,
        inout("ecx") VMWARE_CMD_GET_VERSION => _,
        inout("edx") u32::from(VMWARE_BACKDOOR_PORT) => _,
        options(nostack),
    );
    ebx as u32
}

/// Probe body: does the VMware backdoor answer?
pub fn vmware_backdoor_answers() -> Finding {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: only dispatched under a fault boundary (contained child or
        // terminal handler).
        let ebx = unsafe { vmware_backdoor_ebx() };
        Finding::from_detected(ebx == VMWARE_BACKDOOR_MAGIC)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        Finding::Inconclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_string_trims_padding() {
        // "KVMKVMKVM\0\0\0"
        let ebx = u32::from_le_bytes(*b"KVMK");
        let ecx = u32::from_le_bytes(*b"VMKV");
        let edx = u32::from_le_bytes([b'M', 0, 0, 0]);
        assert_eq!(vendor_string(ebx, ecx, edx), "KVMKVMKVM");
    }

    #[test]
    fn test_vendor_string_vmware() {
        let ebx = u32::from_le_bytes(*b"VMwa");
        let ecx = u32::from_le_bytes(*b"reVM");
        let edx = u32::from_le_bytes(*b"ware");
        assert_eq!(vendor_string(ebx, ecx, edx), "VMwareVMware");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_cpuid_queries_answer_on_x86_64() {
        assert!(cpuid(0).is_some());
        assert!(hypervisor_bit().is_some());
        assert!(vmexit_cycles().is_some());
    }
}
