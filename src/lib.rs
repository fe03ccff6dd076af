//! tv6: the storage and virtual-memory core of a small teaching OS.
//!
//! Three subsystems: the buffered block I/O layer (`bio`), the on-disk
//! file system with hierarchical directories and extensible files
//! (`fs`, `file`), and the demand-paged virtual memory manager with
//! swap and memory-mapped files (`vm`). Boot, scheduling, traps and
//! device drivers are external collaborators reached through the `hal`
//! traits; `kernel` ties the subsystems together with explicit
//! init-once lifecycle entry points.

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny lints that bite kernel code.
#![deny(anonymous_parameters)]
#![deny(keyword_idents)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]

extern crate alloc;

pub mod bio;
pub mod file;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod lock;
pub mod param;
pub mod proc;
pub mod vm;
