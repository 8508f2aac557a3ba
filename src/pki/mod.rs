pub mod builder;
pub mod extensions;
pub mod huffman;
pub mod oid;
pub mod payload;
pub mod signer;

pub use builder::{
    allocate_serial, build_certificate, BuiltCertificate, CertificateRequest, DistinguishedName,
    SerialHandle, Validity, validate_subject,
};
pub use extensions::{
    compact_extensions, legacy_extensions, EntitlementType, ExtensionValue, X509Extension,
};
pub use payload::{encode_payload, EntitlementBody, PayloadBlock};
pub use signer::{
    CaSigner, InMemoryKeyPairProvider, KeyPairProvider, LocalCertificateAuthority, SignatureScheme,
};
