//! Physical and virtual memory management.
//!
//! - `address` — physical/virtual address newtypes and the HHDM window
//! - `pmm`     — the frame allocator seam and its free-list implementation
//! - `vmm`     — single-page edits on 4-level page tables
//! - `kmap`    — the kernel half shared by every address space
//! - `space`   — per-process address spaces

pub mod address;
pub mod kmap;
pub mod pmm;
pub mod space;
pub mod vmm;
