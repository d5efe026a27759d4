// Lockgate
// Copyright (c) 2026
//
// Wayland session locker with a sandboxed background plugin.
// The plugin is an ordinary Wayland client talking to an embedded
// server; its surfaces are forwarded to the real compositor as
// subsurfaces of the lock surfaces.

pub mod config;
pub mod core;
pub mod protocols;
pub mod util;

#[cfg(test)]
mod tests;
