//! Identity resolution: handle → (DID, PDS URL) and DID → document.
//!
//! The default [`SlingshotResolver`] tries, in order:
//! 1. Slingshot mini-doc (`com.bad-example.identity.resolveMiniDoc`), which
//!    returns DID, handle, and PDS in a single call.
//! 2. Slingshot `com.atproto.identity.resolveHandle`, then a DID-document
//!    lookup.
//! 3. The public AppView `com.atproto.identity.resolveHandle`, then a
//!    DID-document lookup.
//! 4. `https://<handle>/.well-known/atproto-did`, then a DID-document lookup.
//!
//! DID documents come from the PLC directory for `did:plc` and from the
//! well-known `did.json` location for `did:web`.

pub mod resolver;

pub use resolver::{
    DidDocument, HandleResolver, IdentityError, ResolvedIdentity, SlingshotResolver, resolve_did,
};
