//! Narrow interface to the virtual memory mapper (§6).
//!
//! Like [`pmm`](super::pmm), the page-table walker lives outside this
//! crate. The heap only ever asks it to map or unmap single pages.

use memory_addresses::VirtAddr;

use super::pmm::PhysAddr;

bitflags::bitflags! {
	/// Caller-requested mapping attributes, translated to architectural
	/// page-table flags by the `VirtualMapper` implementation. NX (no
	/// execute) is the default -- callers opt into executable mappings
	/// explicitly (§4.2: "translate caller flags ... NX is the default").
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MapFlags: u8 {
		const WRITABLE   = 0b01;
		const EXECUTABLE = 0b10;
	}
}

/// `vmm_map`/`vmm_unmap`: installs or removes a single page mapping.
pub trait VirtualMapper {
	/// Maps `virt` to `phys` with the given attributes. Returns `true` on
	/// success.
	fn map(&self, virt: VirtAddr, phys: PhysAddr, flags: MapFlags) -> bool;

	/// Removes the mapping at `virt`, returning the physical address that
	/// was mapped there, or `None` if `virt` was not mapped.
	///
	/// Unmapping an already-unmapped page is tolerated and returns `None`
	/// rather than panicking (§4.2: partial-allocation failures leave some
	/// ALLOCATED pages genuinely unmapped, and free must cope).
	fn unmap(&self, virt: VirtAddr) -> Option<PhysAddr>;
}
