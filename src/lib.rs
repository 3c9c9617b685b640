//! CSI plugin for volumes managed by a restvirt control plane.
//!
//! The controller plane creates volumes and attaches them to domains through
//! the restvirt REST API; the node plane formats and mounts the attached disks.

pub mod backend;
pub mod config;
pub mod csi;
pub mod mount;
