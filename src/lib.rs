//! uvm: the demand-paged virtual-memory core of an educational
//! kernel.
//!
//! Per-process supplemental page tables map user virtual addresses to
//! lazily materialized pages — anonymous, file-backed, or still
//! awaiting their first fault — while a global frame table feeds the
//! claim pipeline and evicts with a second-chance clock when the user
//! pool runs dry. The machine-facing seams (physical pages, the
//! hardware page table, the filesystem) are modeled in software so the
//! whole subsystem runs under host tests; every system-wide resource
//! is owned by an explicitly constructed [`vm::Vm`].

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny lints that bite in unsafe-heavy code.
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]
#![deny(non_ascii_idents)]
#![deny(unused_import_braces)]

extern crate alloc;

pub mod addr;
pub mod error;
pub mod hash;
pub mod list;
pub mod memlayout;
pub mod page;
pub mod palloc;
pub mod param;
pub mod pml4;
pub mod proc;
pub mod vm;

pub use error::{Result, VmError};
pub use proc::{Fault, Proc};
pub use vm::{Vm, VmType};
