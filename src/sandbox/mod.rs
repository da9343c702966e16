mod chroot;
mod closure;
mod exec;
mod id_map;
mod sandbox_struct;
mod setup;

pub use sandbox_struct::*;
