//! Page-granular kernel heap (§4.2).
//!
//! The heap is a sorted, doubly-linked list of [`HeapNode`] headers, each
//! one page in size and stored *in* the memory it describes: a node at
//! virtual address `h` owns the payload range `[h + FRAME_SIZE, end)`, and
//! the next node's header (if any) begins exactly at `end`. The list always
//! tiles the heap's reserved virtual range with no gap and no overlap
//! (§8: "heap totality").
//!
//! This is the one place in the crate that manages a raw intrusive linked
//! list (§9: "model the list with ... tagged raw-pointer wrappers inside an
//! `unsafe` perimeter"). Every other module treats the heap as an opaque
//! allocator.

use core::ptr::NonNull;

use align_address::Align;
use memory_addresses::VirtAddr;

use crate::config::FRAME_SIZE;
use crate::mm::pmm::PhysFrameAllocator;
use crate::mm::vmm::{MapFlags, VirtualMapper};
use crate::sync::SpinlockIrqSave;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
	Free,
	Reserved,
	Allocated,
}

/// One node's on-disk (in-memory) layout. Lives at the start of its own
/// header page; `start`/`end` describe the payload range that follows.
#[repr(C)]
struct HeapNode {
	prev: Option<NonNull<HeapNode>>,
	next: Option<NonNull<HeapNode>>,
	state: NodeState,
	start: VirtAddr,
	end: VirtAddr,
}

impl HeapNode {
	fn size(&self) -> usize {
		(self.end.as_u64() - self.start.as_u64()) as usize
	}

	fn header_addr(&self) -> VirtAddr {
		VirtAddr::new(self.start.as_u64() - FRAME_SIZE as u64)
	}
}

/// Bounds of the heap's reserved virtual-address range.
///
/// `base` is where the root node's header is mapped; the usable range for
/// payload pages is `(base, end)`, since `base`'s own page is spent on the
/// root header.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
	pub base: VirtAddr,
	pub end: VirtAddr,
}

struct HeapInner {
	root: Option<NonNull<HeapNode>>,
}

// The node list is only ever touched under `lock`, and every pointer it
// contains targets memory owned exclusively by this heap.
unsafe impl Send for HeapInner {}

/// The kernel heap. Generic over the physical-frame allocator and virtual
/// mapper so production code can supply the real ones and tests can supply
/// hosted mocks (§10.1, §10.4).
pub struct Heap<P: PhysFrameAllocator, V: VirtualMapper> {
	config: HeapConfig,
	pmm: P,
	vmm: V,
	inner: SpinlockIrqSave<HeapInner>,
}

impl<P: PhysFrameAllocator, V: VirtualMapper> Heap<P, V> {
	/// Reserves `config`'s virtual range and maps the root node's header.
	///
	/// Boot-time fatal (§7.3): panics rather than returning an error, since
	/// the heap is non-optional and the rest of boot cannot proceed without
	/// it.
	pub fn init(pmm: P, vmm: V, config: HeapConfig) -> Self {
		let frame = pmm
			.alloc()
			.expect("kernel heap: out of physical frames for root header");
		if !vmm.map(config.base, frame, MapFlags::WRITABLE) {
			unsafe { pmm.free(frame) };
			panic!("kernel heap: failed to map root header page");
		}

		let root = HeapNode {
			prev: None,
			next: None,
			state: NodeState::Free,
			start: VirtAddr::new(config.base.as_u64() + FRAME_SIZE as u64),
			end: config.end,
		};
		unsafe { config.base.as_mut_ptr::<HeapNode>().write(root) };
		let root = NonNull::new(config.base.as_mut_ptr::<HeapNode>()).unwrap();

		Self {
			config,
			pmm,
			vmm,
			inner: SpinlockIrqSave::new(HeapInner { root: Some(root) }),
		}
	}

	/// Reserves `size` bytes of virtual address space without backing it
	/// with physical memory; the caller is responsible for mapping it.
	pub fn reserve(&self, size: usize) -> Option<VirtAddr> {
		self.allocate_inner(size, None)
	}

	/// Reserves `size` bytes and backs every page with a freshly allocated,
	/// freshly mapped physical frame using `flags`.
	pub fn allocate(&self, size: usize, flags: MapFlags) -> Option<VirtAddr> {
		self.allocate_inner(size, Some(flags))
	}

	fn allocate_inner(&self, size: usize, backing: Option<MapFlags>) -> Option<VirtAddr> {
		let size = size.align_up(FRAME_SIZE);
		let mut inner = self.inner.lock();

		let node_ptr = self.find_first_fit(&inner, size)?;
		self.maybe_split(node_ptr, size);

		// SAFETY: `node_ptr` came from the list we hold the lock for.
		let node = unsafe { node_ptr.as_ptr().as_mut().unwrap() };
		node.state = NodeState::Reserved;
		let payload = node.start;

		let Some(flags) = backing else {
			return Some(payload);
		};

		node.state = NodeState::Allocated;
		let mut page = node.start;
		let mut failed = false;
		while page < node.end {
			match self.pmm.alloc() {
				Some(frame) => {
					if !self.vmm.map(page, frame, flags) {
						unsafe { self.pmm.free(frame) };
						failed = true;
						break;
					}
				}
				None => {
					failed = true;
					break;
				}
			}
			page = VirtAddr::new(page.as_u64() + FRAME_SIZE as u64);
		}

		if failed {
			// Full rollback via the free path: pages already mapped get
			// unmapped and their frames returned, pages never reached are
			// tolerated as "not yet mapped" (§4.2 failure modes).
			self.deallocate_locked(payload);
			return None;
		}

		Some(payload)
	}

	fn find_first_fit(&self, inner: &HeapInner, size: usize) -> Option<NonNull<HeapNode>> {
		let mut cursor = inner.root;
		while let Some(ptr) = cursor {
			// SAFETY: list nodes are only read/written under `self.inner`'s
			// lock, which the caller holds.
			let node = unsafe { ptr.as_ref() };
			if node.state == NodeState::Free && node.size() >= size {
				return Some(ptr);
			}
			cursor = node.next;
		}
		None
	}

	/// Splits `node` in two if the leftover space (beyond `size`) is worth
	/// a new header page. A failed split (no frame, or mapping it failed)
	/// is tolerated silently -- the original node is used intact (§4.2).
	fn maybe_split(&self, node_ptr: NonNull<HeapNode>, size: usize) {
		let node = unsafe { node_ptr.as_ptr().as_mut().unwrap() };
		let extra = node.size() - size;
		if extra < crate::config::MIN_SPLIT_FRAMES * FRAME_SIZE {
			return;
		}

		let Some(frame) = self.pmm.alloc() else {
			return;
		};
		let new_header = VirtAddr::new(node.start.as_u64() + size as u64);
		if !self.vmm.map(new_header, frame, MapFlags::WRITABLE) {
			unsafe { self.pmm.free(frame) };
			return;
		}

		let new_node = HeapNode {
			prev: Some(node_ptr),
			next: node.next,
			state: NodeState::Free,
			start: VirtAddr::new(new_header.as_u64() + FRAME_SIZE as u64),
			end: node.end,
		};
		unsafe { new_header.as_mut_ptr::<HeapNode>().write(new_node) };
		let new_ptr = NonNull::new(new_header.as_mut_ptr::<HeapNode>()).unwrap();

		if let Some(mut next) = node.next {
			unsafe { next.as_mut().prev = Some(new_ptr) };
		}
		node.next = Some(new_ptr);
		node.end = new_header;
	}

	/// Frees the allocation whose payload starts at `ptr` (§4.2 "free
	/// algorithm").
	pub fn deallocate(&self, ptr: VirtAddr) {
		let _inner = self.inner.lock();
		self.deallocate_locked(ptr);
	}

	fn deallocate_locked(&self, ptr: VirtAddr) {
		let header = VirtAddr::new(ptr.as_u64() - FRAME_SIZE as u64);
		let node_ptr = NonNull::new(header.as_mut_ptr::<HeapNode>())
			.expect("kernel heap: free of a null pointer");
		let node = unsafe { node_ptr.as_ptr().as_mut().unwrap() };
		assert!(
			node.state != NodeState::Free,
			"kernel heap: double free at {ptr:?}"
		);

		if node.state == NodeState::Allocated {
			let mut page = node.start;
			while page < node.end {
				if let Some(phys) = self.vmm.unmap(page) {
					unsafe { self.pmm.free(phys) };
				}
				page = VirtAddr::new(page.as_u64() + FRAME_SIZE as u64);
			}
		}
		node.state = NodeState::Free;

		self.coalesce_next(node_ptr);
		self.coalesce_prev(node_ptr);
	}

	fn coalesce_next(&self, node_ptr: NonNull<HeapNode>) {
		let node = unsafe { node_ptr.as_ptr().as_mut().unwrap() };
		let Some(next_ptr) = node.next else {
			return;
		};
		let next = unsafe { next_ptr.as_ref() };
		if next.state != NodeState::Free {
			return;
		}

		let absorbed_header = next.header_addr();
		let absorbed_end = next.end;
		let absorbed_next = next.next;

		node.end = absorbed_end;
		node.next = absorbed_next;
		if let Some(mut nn) = absorbed_next {
			unsafe { nn.as_mut().prev = Some(node_ptr) };
		}

		// The node being absorbed here is `next`; its header is what gets
		// returned, never some other node reached later.
		if let Some(phys) = self.vmm.unmap(absorbed_header) {
			unsafe { self.pmm.free(phys) };
		}
	}

	fn coalesce_prev(&self, node_ptr: NonNull<HeapNode>) {
		let node = unsafe { node_ptr.as_ref() };
		let Some(mut prev_ptr) = node.prev else {
			return;
		};
		let prev = unsafe { prev_ptr.as_ref() };
		if prev.state != NodeState::Free {
			return;
		}

		// `node` (not `prev`, and not whatever `next` used to be) is the
		// node being absorbed: it vanishes into its predecessor, so its own
		// header is what must be freed. See the corrected Open Question in
		// SPEC_FULL.md §9 -- the historical bug freed `next`'s header here
		// instead of the node actually being absorbed.
		let absorbed_header = node.header_addr();
		let absorbed_end = node.end;
		let absorbed_next = node.next;

		unsafe {
			let prev_mut = prev_ptr.as_mut();
			prev_mut.end = absorbed_end;
			prev_mut.next = absorbed_next;
		}
		if let Some(mut nn) = absorbed_next {
			unsafe { nn.as_mut().prev = Some(prev_ptr) };
		}
		// `node` always has a predecessor here (we just matched on
		// `node.prev`), so it can never be the list's root -- no root
		// pointer fixup is needed.

		if let Some(phys) = self.vmm.unmap(absorbed_header) {
			unsafe { self.pmm.free(phys) };
		}
	}

	/// Total bytes tiled by the node list, and the node count -- used by
	/// tests to assert heap totality (§8).
	#[cfg(test)]
	pub(crate) fn tiling(&self) -> (usize, alloc::vec::Vec<(VirtAddr, VirtAddr, NodeState)>) {
		let inner = self.inner.lock();
		let mut nodes = alloc::vec::Vec::new();
		let mut cursor = inner.root;
		while let Some(ptr) = cursor {
			let node = unsafe { ptr.as_ref() };
			nodes.push((node.start, node.end, node.state));
			cursor = node.next;
		}
		(nodes.len(), nodes)
	}
}

#[cfg(test)]
mod tests {
	use alloc::boxed::Box;
	use alloc::collections::BTreeMap;
	use core::cell::RefCell;

	use super::*;
	use crate::mm::pmm::PhysAddr;

	/// Hosted physical-memory mock: a flat arena handed out one frame at a
	/// time, with optional fault injection on the k-th allocation (§8
	/// "allocation rollback").
	struct MockPmm {
		arena: *mut u8,
		frame_count: usize,
		next: RefCell<usize>,
		free_list: RefCell<alloc::vec::Vec<usize>>,
		fail_at: Option<usize>,
		alloc_calls: RefCell<usize>,
	}

	impl MockPmm {
		fn new(frame_count: usize) -> Self {
			let layout =
				core::alloc::Layout::from_size_align(frame_count * FRAME_SIZE, FRAME_SIZE)
					.unwrap();
			let arena = unsafe { alloc::alloc::alloc_zeroed(layout) };
			Self {
				arena,
				frame_count,
				next: RefCell::new(0),
				free_list: RefCell::new(alloc::vec::Vec::new()),
				fail_at: None,
				alloc_calls: RefCell::new(0),
			}
		}

		fn failing_at(mut self, k: usize) -> Self {
			self.fail_at = Some(k);
			self
		}

		fn frames_outstanding(&self) -> usize {
			*self.next.borrow() - self.free_list.borrow().len()
		}
	}

	impl PhysFrameAllocator for MockPmm {
		fn alloc(&self) -> Option<PhysAddr> {
			*self.alloc_calls.borrow_mut() += 1;
			if self.fail_at == Some(*self.alloc_calls.borrow()) {
				return None;
			}
			if let Some(idx) = self.free_list.borrow_mut().pop() {
				return Some(PhysAddr::new(idx as u64));
			}
			let mut next = self.next.borrow_mut();
			if *next >= self.frame_count {
				return None;
			}
			let idx = *next;
			*next += 1;
			Some(PhysAddr::new(idx as u64))
		}

		unsafe fn free(&self, frame: PhysAddr) {
			self.free_list.borrow_mut().push(frame.as_u64() as usize);
		}
	}

	/// Hosted virtual-mapper mock: backs every mapped page with a real
	/// slice of the `MockPmm` arena so the heap's header/payload reads and
	/// writes are genuine memory accesses, not just bookkeeping.
	struct MockVmm {
		arena: *mut u8,
		mapped: RefCell<BTreeMap<u64, u64>>,
		base: u64,
	}

	impl MockVmm {
		fn new(arena: *mut u8, base: VirtAddr) -> Self {
			Self {
				arena,
				mapped: RefCell::new(BTreeMap::new()),
				base: base.as_u64(),
			}
		}
	}

	impl VirtualMapper for MockVmm {
		fn map(&self, virt: VirtAddr, phys: PhysAddr, _flags: MapFlags) -> bool {
			self.mapped.borrow_mut().insert(virt.as_u64(), phys.as_u64());
			true
		}

		fn unmap(&self, virt: VirtAddr) -> Option<PhysAddr> {
			self.mapped
				.borrow_mut()
				.remove(&virt.as_u64())
				.map(|p| PhysAddr::new(p))
		}
	}

	/// A virtual address range backed 1:1 by `arena`, so that writes the
	/// heap makes through `VirtAddr`s land in real, inspectable memory.
	fn harness(npages: usize) -> (Heap<MockPmm, MockVmm>, VirtAddr) {
		harness_with(MockPmm::new(npages + 4), npages)
	}

	fn harness_with(pmm: MockPmm, npages: usize) -> (Heap<MockPmm, MockVmm>, VirtAddr) {
		let total_pages = npages + 4;
		let layout =
			core::alloc::Layout::from_size_align(total_pages * FRAME_SIZE, FRAME_SIZE).unwrap();
		let backing = unsafe { alloc::alloc::alloc_zeroed(layout) };
		let base = VirtAddr::new(backing as u64);
		let vmm = MockVmm::new(backing, base);
		let config = HeapConfig {
			base,
			end: VirtAddr::new(base.as_u64() + (total_pages * FRAME_SIZE) as u64),
		};
		let heap = Heap::init(pmm, vmm, config);
		(heap, base)
	}

	#[test]
	fn totality_after_init() {
		let (heap, base) = harness(16);
		let (count, nodes) = heap.tiling();
		assert_eq!(count, 1);
		assert_eq!(nodes[0].0.as_u64(), base.as_u64() + FRAME_SIZE as u64);
	}

	#[test]
	fn scenario_alloc_splits_one_node_into_two() {
		let (heap, base) = harness(16);
		let addr = heap
			.allocate(4 * FRAME_SIZE, MapFlags::WRITABLE)
			.expect("allocation should succeed");
		assert_eq!(addr.as_u64(), base.as_u64() + FRAME_SIZE as u64);

		let (count, nodes) = heap.tiling();
		assert_eq!(count, 2);
		assert_eq!(nodes[0].2, NodeState::Allocated);
		assert_eq!((nodes[0].1.as_u64() - nodes[0].0.as_u64()) as usize, 4 * FRAME_SIZE);
		assert_eq!(nodes[1].2, NodeState::Free);
	}

	#[test]
	fn scenario_three_allocs_then_frees_leave_one_free_node() {
		let (heap, _base) = harness(3);
		let a = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();
		let b = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();
		let c = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();

		heap.deallocate(b);
		heap.deallocate(a);
		heap.deallocate(c);

		let (count, nodes) = heap.tiling();
		assert_eq!(count, 1);
		assert_eq!(nodes[0].2, NodeState::Free);
	}

	#[test]
	fn coalescing_returns_both_header_frames() {
		let pmm = MockPmm::new(16);
		let (heap, _base) = harness_with(pmm, 4);
		let a = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();
		let b = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();
		let c = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();

		// Free the outer two first so their neighbors (the remaining
		// trailing free node, and `b`) are not yet free; then free `b`,
		// which coalesces with both its now-free predecessor and successor
		// in a single call.
		heap.deallocate(a);
		heap.deallocate(c);

		let before = heap.pmm.frames_outstanding();
		let before_count = heap.tiling().0;
		heap.deallocate(b);
		let after = heap.pmm.frames_outstanding();
		let after_count = heap.tiling().0;

		assert_eq!(before - after, 2, "two header frames must be released");
		assert!(after_count < before_count, "neighbors must merge away");
	}

	#[test]
	fn allocation_rollback_on_k_th_frame_failure() {
		// Call #1 is the root header (init). Call #2 is the split's new
		// header (the request leaves more than `MIN_SPLIT_FRAMES` frames
		// spare). Call #3 is this allocation's first payload page -- fail
		// it and expect a clean rollback with nothing left outstanding.
		let pmm = MockPmm::new(16).failing_at(3);
		let (heap, _base) = harness_with(pmm, 8);

		let before = heap.tiling();
		let result = heap.allocate(3 * FRAME_SIZE, MapFlags::WRITABLE);
		assert!(result.is_none());

		let after = heap.tiling();
		assert_eq!(before.0, after.0, "node count must be restored");
	}

	#[test]
	#[should_panic(expected = "double free")]
	fn double_free_panics() {
		let (heap, _base) = harness(1);
		let a = heap.allocate(FRAME_SIZE, MapFlags::WRITABLE).unwrap();
		heap.deallocate(a);
		heap.deallocate(a);
	}
}
