//! Core library for the `MageBox` team server.
//!
//! Contains the stateless building blocks: AES-256-GCM secret encryption,
//! Argon2id token hashing, Ed25519 identity and SSH certificate authority
//! operations, the audit hash chain, TOTP multi-factor codes, and the SSH
//! deployer that reconciles `authorized_keys` on remote hosts. This crate
//! knows nothing about persistence or HTTP.

pub mod audit;
pub mod crypto;
pub mod deploy;
pub mod error;
pub mod mfa;
pub mod ssh;
