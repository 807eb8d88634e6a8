//! Resolution of the domain parameters PACE runs on.


use std::fmt;

use crypto_bigint::BoxedUint;
use tracing::debug;

use crate::config::PaceConfig;
use crate::crypt::{boxed_uint_from_be_slice, compare_uints};
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::crypt::elliptic::curves;
use crate::pace::error::PaceError;
use crate::pace::info::PaceSelection;
use crate::pace::oids::{DH_PUBLIC_NUMBER, EC_PUBLIC_KEY, PRIME_FIELD};
use crate::tlv::{oid_to_der_bytes, Tag, Tlv};


/// Elliptic-curve domain parameters.
///
/// The value is immutable; mapping produces a new value with a different generator.
#[derive(Clone, Eq, PartialEq)]
pub struct DomainParameters {
    id: Option<u8>,
    name: &'static str,
    curve: PrimeWeierstrassCurve,
}
impl DomainParameters {
    /// The standardized domain parameters with the given ID.
    pub fn standardized(id: u8) -> Option<Self> {
        let (name, curve) = curves::by_standardized_id(id)?;
        Some(Self { id: Some(id), name, curve })
    }

    /// The standardized ID, if the parameters were referenced by one.
    pub fn id(&self) -> Option<u8> { self.id }
    pub fn name(&self) -> &'static str { self.name }
    pub fn curve(&self) -> &PrimeWeierstrassCurve { &self.curve }
    pub fn generator(&self) -> &AffinePoint { self.curve.generator() }
    pub fn cofactor(&self) -> u8 { self.curve.cofactor() }

    /// The same parameters with a different generator, as produced by a mapping.
    pub(crate) fn with_generator(&self, generator: AffinePoint) -> Self {
        Self {
            id: self.id,
            name: self.name,
            curve: self.curve.with_generator(generator),
        }
    }
}
impl fmt::Debug for DomainParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainParameters")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}


/// Resolves the domain parameters of the chosen PACE offer.
///
/// Standardized parameters are looked up in the table of named curves; explicit parameters are
/// only accepted if they describe one of the named curves exactly. Either way, the curve must be
/// allowed by the configuration.
pub fn resolve(selection: &PaceSelection, config: &PaceConfig) -> Result<DomainParameters, PaceError> {
    if let Some(id) = selection.info.standardized_parameter_id() {
        if !config.is_parameter_id_allowed(id) {
            return Err(PaceError::UnsupportedDomainParameters(format!("parameter ID {} is not allowed", id)));
        }
        let parameters = DomainParameters::standardized(id)
            .ok_or_else(|| PaceError::UnsupportedDomainParameters(format!("unknown parameter ID {}", id)))?;
        debug!(id, name = parameters.name, "resolved standardized domain parameters");
        return Ok(parameters);
    }

    let Some(domain_info) = &selection.domain_parameter_info else {
        return Err(PaceError::UnsupportedDomainParameters("no domain parameters given".to_owned()));
    };
    let parameters = resolve_explicit(domain_info.domain_parameter.as_bytes(), config)?;
    debug!(name = parameters.name, "resolved explicit domain parameters");
    Ok(parameters)
}


/// Matches a DER-encoded `AlgorithmIdentifier` against the allowed named curves.
fn resolve_explicit(algorithm_identifier: &[u8], config: &PaceConfig) -> Result<DomainParameters, PaceError> {
    let explicit = ExplicitCurve::decode(algorithm_identifier)?;
    curves::standardized()
        .filter(|(id, _, _)| config.is_parameter_id_allowed(*id))
        .find(|(_, _, curve)| explicit.matches(curve))
        .map(|(_, name, curve)| DomainParameters { id: None, name, curve })
        .ok_or_else(|| PaceError::UnsupportedDomainParameters("explicit domain parameters match no allowed curve".to_owned()))
}


fn unsupported(reason: &str) -> PaceError {
    PaceError::UnsupportedDomainParameters(reason.to_owned())
}


/// Explicit prime-field elliptic-curve parameters (`ECParameters` from BSI TR-03111).
///
/// ```plain
/// AlgorithmIdentifier ::= SEQUENCE {
///     algorithm   OBJECT IDENTIFIER, -- id-ecPublicKey
///     parameters  ECParameters }
/// ECParameters ::= SEQUENCE {
///     version     INTEGER { ecpVer1(1) },
///     fieldID     SEQUENCE { fieldType OBJECT IDENTIFIER, prime INTEGER },
///     curve       SEQUENCE { a OCTET STRING, b OCTET STRING, seed BIT STRING OPTIONAL },
///     base        OCTET STRING,
///     order       INTEGER,
///     cofactor    INTEGER OPTIONAL }
/// ```
struct ExplicitCurve {
    prime: Vec<u8>,
    a: Vec<u8>,
    b: Vec<u8>,
    base: Vec<u8>,
    order: Vec<u8>,
    cofactor: Option<Vec<u8>>,
}
impl ExplicitCurve {
    fn decode(algorithm_identifier: &[u8]) -> Result<Self, PaceError> {
        let root = Tlv::parse(algorithm_identifier)?;
        root.expect_tag(Tag::SEQUENCE)?;
        let mut fields = root.children();

        let algorithm = fields.next()
            .and_then(|f| f.expect_tag(Tag::OBJECT_IDENTIFIER).ok())
            .ok_or_else(|| unsupported("AlgorithmIdentifier without algorithm"))?;
        let algorithm_oid = algorithm.primitive_value().unwrap_or_default();
        if algorithm_oid == oid_to_der_bytes(DH_PUBLIC_NUMBER) {
            return Err(unsupported("Diffie-Hellman domain parameters"));
        }
        if algorithm_oid != oid_to_der_bytes(EC_PUBLIC_KEY) {
            return Err(PaceError::UnsupportedDomainParameters(format!("algorithm {}", hex::encode_upper(algorithm_oid))));
        }

        let parameters = fields.next()
            .and_then(|f| f.expect_tag(Tag::SEQUENCE).ok())
            .ok_or_else(|| unsupported("named or implicit curve references"))?;
        let mut parameter_fields = parameters.children();

        let version = primitive(parameter_fields.next(), Tag::INTEGER)?;
        if version != [0x01] {
            return Err(unsupported("ECParameters version"));
        }

        let field_id = parameter_fields.next()
            .and_then(|f| f.expect_tag(Tag::SEQUENCE).ok())
            .ok_or_else(|| unsupported("missing fieldID"))?;
        let field_type = field_id.first_child()
            .filter(|f| f.tag() == Tag::OBJECT_IDENTIFIER)
            .ok_or_else(|| unsupported("missing field type"))?;
        if field_type.primitive_value() != Some(oid_to_der_bytes(PRIME_FIELD).as_slice()) {
            return Err(unsupported("curves over characteristic-two fields"));
        }
        let prime = primitive(field_type.next(), Tag::INTEGER)?;

        let curve = parameter_fields.next()
            .and_then(|f| f.expect_tag(Tag::SEQUENCE).ok())
            .ok_or_else(|| unsupported("missing curve"))?;
        let mut coefficients = curve.children();
        let a = primitive(coefficients.next(), Tag::OCTET_STRING)?;
        let b = primitive(coefficients.next(), Tag::OCTET_STRING)?;

        let base = primitive(parameter_fields.next(), Tag::OCTET_STRING)?;
        let order = primitive(parameter_fields.next(), Tag::INTEGER)?;
        let cofactor = match parameter_fields.next() {
            Some(node) => Some(primitive(Some(node), Tag::INTEGER)?),
            None => None,
        };

        Ok(Self { prime, a, b, base, order, cofactor })
    }

    fn matches(&self, curve: &PrimeWeierstrassCurve) -> bool {
        let same = |bytes: &[u8], value: &BoxedUint| compare_uints(&boxed_uint_from_be_slice(bytes), value).is_eq();
        let cofactor_matches = match &self.cofactor {
            Some(cofactor) => {
                let significant: Vec<u8> = cofactor.iter().copied().skip_while(|b| *b == 0x00).collect();
                significant == [curve.cofactor()]
            },
            None => curve.cofactor() == 1,
        };
        same(&self.prime, curve.prime())
            && same(&self.a, curve.coefficient_a())
            && same(&self.b, curve.coefficient_b())
            && same(&self.order, curve.order())
            && cofactor_matches
            && curve.decode_point(&self.base).as_ref() == Some(curve.generator())
    }
}


fn primitive(node: Option<&Tlv>, tag: Tag) -> Result<Vec<u8>, PaceError> {
    let node = node.ok_or_else(|| unsupported("truncated ECParameters"))?;
    node.expect_tag(tag)?;
    node.primitive_value()
        .map(|v| v.to_vec())
        .ok_or_else(|| unsupported("constructed value in ECParameters"))
}
