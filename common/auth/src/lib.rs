pub mod claims;
pub mod config;
pub mod error;
pub mod extractors;
pub mod identity;
pub mod jwks;
pub mod validator;
pub mod verifier;

pub use claims::{ClaimValidator, TokenClaims, IDENTITY_CLAIM};
pub use config::{
    generate_signing_secret, AuthMode, KeyMaterial, TrustConfig, TrustConfigRecord, TrustMode,
    ValidationMethod, ValidatorOptions, MANAGED_AUDIENCE, MANAGED_ISSUER,
};
pub use error::{AuthError, AuthResult};
pub use extractors::{AuthContext, BearerToken, ValidatorResolver, AUTH_COOKIE_NAME};
pub use identity::{CanonicalIdentity, IdentityClaim, IdentityExtractor, IDENTITY_SCHEMA_VERSION};
pub use jwks::{JwksCache, JwksFetcher};
pub use validator::Validator;
pub use verifier::{SignatureVerifier, VerifiedToken};
