//! Elliptic-curve cryptography over prime fields.


pub mod curves;


use std::fmt;
use std::ops::{Add, Mul};

use crypto_bigint::BoxedUint;
use crypto_bigint::modular::{BoxedMontyForm, BoxedMontyParams};
use subtle::{Choice, ConstantTimeEq, CtOption};

use crate::crypt::{boxed_uint_from_be_slice_with_precision, compare_uints, resize_uint, uint_to_fixed_be};


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AffinePoint {
    x: BoxedUint,
    y: BoxedUint,
}
impl AffinePoint {
    pub const fn new(x: BoxedUint, y: BoxedUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BoxedUint { &self.x }
    pub fn y(&self) -> &BoxedUint { &self.y }
}


/// A point in projective coordinates in Montgomery form.
#[derive(Clone, Debug)]
struct MontyProjectivePoint {
    x: BoxedMontyForm,
    y: BoxedMontyForm,
    z: BoxedMontyForm,
}


#[derive(Clone, Debug)]
struct MontyKnowledge {
    params: BoxedMontyParams,
    a: BoxedMontyForm,
    b: BoxedMontyForm,
    b3: BoxedMontyForm,
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number, together with the
/// generator of the group used on it.
#[derive(Clone)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BoxedUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BoxedUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BoxedUint,

    /// The coordinates of the generator point of the group.
    generator: AffinePoint,

    /// The order of the generator.
    order: BoxedUint,

    /// The cofactor of the group, i.e. the number of points on the curve divided by the order.
    cofactor: u8,

    monty: MontyKnowledge,
}
impl PrimeWeierstrassCurve {
    /// Assembles a curve, checking that the prime is odd and the generator lies on the curve.
    pub fn new(
        prime: BoxedUint,
        coefficient_a: BoxedUint,
        coefficient_b: BoxedUint,
        generator: AffinePoint,
        order: BoxedUint,
        cofactor: u8,
    ) -> Option<Self> {
        let odd_prime = Option::from(prime.to_odd())?;
        let params = BoxedMontyParams::new(odd_prime);
        let precision = prime.bits_precision();

        for value in [&coefficient_a, &coefficient_b, generator.x(), generator.y()] {
            if compare_uints(value, &prime).is_ge() {
                return None;
            }
        }
        let coefficient_a = resize_uint(&coefficient_a, precision);
        let coefficient_b = resize_uint(&coefficient_b, precision);
        let generator = AffinePoint::new(
            resize_uint(generator.x(), precision),
            resize_uint(generator.y(), precision),
        );

        let a = BoxedMontyForm::new(coefficient_a.clone(), params.clone());
        let b = BoxedMontyForm::new(coefficient_b.clone(), params.clone());
        let b3 = (&b).add(&b).add(&b);
        let monty = MontyKnowledge { params, a, b, b3 };

        let curve = Self {
            prime,
            coefficient_a,
            coefficient_b,
            generator,
            order,
            cofactor,
            monty,
        };
        if !bool::from(curve.is_on_curve(&curve.generator)) {
            return None;
        }
        Some(curve)
    }

    pub fn prime(&self) -> &BoxedUint { &self.prime }
    pub fn coefficient_a(&self) -> &BoxedUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BoxedUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn order(&self) -> &BoxedUint { &self.order }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// The number of bytes needed to encode a field element (a coordinate).
    pub fn field_len_bytes(&self) -> usize {
        self.prime.bits().div_ceil(8) as usize
    }

    /// The number of bytes needed to encode a scalar (a private key).
    pub fn scalar_len_bytes(&self) -> usize {
        self.order.bits().div_ceil(8) as usize
    }

    /// Returns the same curve with a different generator.
    ///
    /// The generator must be a point of the same group.
    pub fn with_generator(&self, generator: AffinePoint) -> Self {
        Self {
            generator,
            ..self.clone()
        }
    }

    /// Whether two curves share prime, coefficients, order and cofactor, regardless of generator.
    pub fn same_group_parameters(&self, other: &Self) -> bool {
        self.prime == other.prime
            && self.coefficient_a == other.coefficient_a
            && self.coefficient_b == other.coefficient_b
            && compare_uints(&self.order, &other.order).is_eq()
            && self.cofactor == other.cofactor
    }

    /// Serializes a point as `0x04 || x || y`, each coordinate in [`Self::field_len_bytes`] bytes.
    pub fn encode_point(&self, point: &AffinePoint) -> Option<Vec<u8>> {
        let field_len = self.field_len_bytes();
        let mut ret = Vec::with_capacity(1 + 2*field_len);
        ret.push(0x04); // uncompressed coordinates
        ret.extend(uint_to_fixed_be(&point.x, field_len)?);
        ret.extend(uint_to_fixed_be(&point.y, field_len)?);
        Some(ret)
    }

    /// Encodes only the x coordinate of the point in [`Self::field_len_bytes`] bytes.
    pub fn encode_x_coordinate(&self, point: &AffinePoint) -> Option<Vec<u8>> {
        uint_to_fixed_be(&point.x, self.field_len_bytes())
    }

    /// Decodes an uncompressed point and validates it.
    ///
    /// Returns `None` if the encoding is wrong, a coordinate is not reduced modulo the prime or the
    /// point does not lie on the curve.
    pub fn decode_point(&self, bytes: &[u8]) -> Option<AffinePoint> {
        let field_len = self.field_len_bytes();
        if bytes.len() != 1 + 2*field_len || bytes[0] != 0x04 {
            // we only support the uncompressed representation
            return None;
        }
        let precision = self.prime.bits_precision();
        let x = boxed_uint_from_be_slice_with_precision(&bytes[1..1+field_len], precision);
        let y = boxed_uint_from_be_slice_with_precision(&bytes[1+field_len..], precision);
        if compare_uints(&x, &self.prime).is_ge() || compare_uints(&y, &self.prime).is_ge() {
            return None;
        }
        let point = AffinePoint::new(resize_uint(&x, precision), resize_uint(&y, precision));
        if !bool::from(self.is_on_curve(&point)) {
            return None;
        }
        Some(point)
    }

    fn internal_is_on_curve(monty: &MontyKnowledge, point: &MontyProjectivePoint) -> Choice {
        let inverse_option = point.z.invert();
        let Some(inverse) = Option::<BoxedMontyForm>::from(inverse_option) else {
            // the point at infinity has no affine representation
            return Choice::from(0);
        };

        let x = (&point.x).mul(&inverse);
        let y = (&point.y).mul(&inverse);

        let y_squared = (&y).mul(&y);
        let x_cubed = (&x).mul(&x).mul(&x);
        let ax = (&x).mul(&monty.a);
        let rhs = (&x_cubed).add(&ax).add(&monty.b);
        y_squared.retrieve().ct_eq(&rhs.retrieve())
    }

    fn internal_affine_to_monty_projective(monty: &MontyKnowledge, point: &AffinePoint) -> MontyProjectivePoint {
        let precision = monty.params.bits_precision();
        let x = BoxedMontyForm::new(resize_uint(&point.x, precision), monty.params.clone());
        let y = BoxedMontyForm::new(resize_uint(&point.y, precision), monty.params.clone());
        let z = BoxedMontyForm::one(monty.params.clone());
        MontyProjectivePoint { x, y, z }
    }

    fn internal_monty_projective_to_affine(point: &MontyProjectivePoint) -> CtOption<AffinePoint> {
        let inverse_option = point.z.invert();
        let is_some = inverse_option.is_some();
        let inverse = Option::<BoxedMontyForm>::from(inverse_option)
            .unwrap_or_else(|| point.z.clone());

        let x = (&point.x).mul(&inverse);
        let y = (&point.y).mul(&inverse);

        CtOption::new(AffinePoint::new(x.retrieve(), y.retrieve()), is_some)
    }

    fn internal_double_point(monty: &MontyKnowledge, point: &MontyProjectivePoint) -> MontyProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 3
        let b3 = &monty.b3;

        // 1. t0 ← X · X
        let mut t0 = (&point.x).mul(&point.x);
        // 2. t1 ← Y · Y
        let t1 = (&point.y).mul(&point.y);
        // 3. t2 ← Z · Z
        let mut t2 = (&point.z).mul(&point.z);
        // 4. t3 ← X · Y
        let mut t3 = (&point.x).mul(&point.y);
        // 5. t3 ← t3 + t3
        t3 = (&t3).add(&t3);
        // 6. Z3 ← X · Z
        let mut z3 = (&point.x).mul(&point.z);
        // 7. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        // 8. X3 ← a · Z3
        let mut x3 = (&monty.a).mul(&z3);
        // 9. Y3 ← b3 · t2
        let mut y3 = b3.mul(&t2);
        // 10. Y3 ← X3 + Y3
        y3 = (&x3).add(&y3);
        // 11. X3 ← t1 − Y3
        x3 = (&t1).sub(&y3);
        // 12. Y3 ← t1 + Y3
        y3 = (&t1).add(&y3);
        // 13. Y3 ← X3 · Y3
        y3 = (&x3).mul(&y3);
        // 14. X3 ← t3 · X3
        x3 = (&t3).mul(&x3);
        // 15. Z3 ← b3 · Z3
        z3 = b3.mul(&z3);
        // 16. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 17. t3 ← t0 − t2
        t3 = (&t0).sub(&t2);
        // 18. t3 ← a · t3
        t3 = (&monty.a).mul(&t3);
        // 19. t3 ← t3 + Z3
        t3 = (&t3).add(&z3);
        // 20. Z3 ← t0 + t0
        z3 = (&t0).add(&t0);
        // 21. t0 ← Z3 + t0
        t0 = (&z3).add(&t0);
        // 22. t0 ← t0 + t2
        t0 = (&t0).add(&t2);
        // 23. t0 ← t0 · t3
        t0 = (&t0).mul(&t3);
        // 24. Y3 ← Y3 + t0
        y3 = (&y3).add(&t0);
        // 25. t2 ← Y · Z
        t2 = (&point.y).mul(&point.z);
        // 26. t2 ← t2 + t2
        t2 = (&t2).add(&t2);
        // 27. t0 ← t2 · t3
        t0 = (&t2).mul(&t3);
        // 28. X3 ← X3 − t0
        x3 = (&x3).sub(&t0);
        // 29. Z3 ← t2 · t1
        z3 = (&t2).mul(&t1);
        // 30. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        // 31. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        MontyProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_add_points(monty: &MontyKnowledge, lhs: &MontyProjectivePoint, rhs: &MontyProjectivePoint) -> MontyProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 1
        let b3 = &monty.b3;

        // 1. t0 ← X1 · X2
        let mut t0 = (&lhs.x).mul(&rhs.x);
        // 2. t1 ← Y1 · Y2
        let mut t1 = (&lhs.y).mul(&rhs.y);
        // 3. t2 ← Z1 · Z2
        let mut t2 = (&lhs.z).mul(&rhs.z);
        // 4. t3 ← X1 + Y1
        let mut t3 = (&lhs.x).add(&lhs.y);
        // 5. t4 ← X2 + Y2
        let mut t4 = (&rhs.x).add(&rhs.y);
        // 6. t3 ← t3 · t4
        t3 = (&t3).mul(&t4);
        // 7. t4 ← t0 + t1
        t4 = (&t0).add(&t1);
        // 8. t3 ← t3 − t4
        t3 = (&t3).sub(&t4);
        // 9. t4 ← X1 + Z1
        t4 = (&lhs.x).add(&lhs.z);
        // 10. t5 ← X2 + Z2
        let mut t5 = (&rhs.x).add(&rhs.z);
        // 11. t4 ← t4 · t5
        t4 = (&t4).mul(&t5);
        // 12. t5 ← t0 + t2
        t5 = (&t0).add(&t2);
        // 13. t4 ← t4 − t5
        t4 = (&t4).sub(&t5);
        // 14. t5 ← Y1 + Z1
        t5 = (&lhs.y).add(&lhs.z);
        // 15. X3 ← Y2 + Z2
        let mut x3 = (&rhs.y).add(&rhs.z);
        // 16. t5 ← t5 · X3
        t5 = (&t5).mul(&x3);
        // 17. X3 ← t1 + t2
        x3 = (&t1).add(&t2);
        // 18. t5 ← t5 − X3
        t5 = (&t5).sub(&x3);
        // 19. Z3 ← a · t4
        let mut z3 = (&monty.a).mul(&t4);
        // 20. X3 ← b3 · t2
        x3 = b3.mul(&t2);
        // 21. Z3 ← X3 + Z3
        z3 = (&x3).add(&z3);
        // 22. X3 ← t1 − Z3
        x3 = (&t1).sub(&z3);
        // 23. Z3 ← t1 + Z3
        z3 = (&t1).add(&z3);
        // 24. Y3 ← X3 · Z3
        let mut y3 = (&x3).mul(&z3);
        // 25. t1 ← t0 + t0
        t1 = (&t0).add(&t0);
        // 26. t1 ← t1 + t0
        t1 = (&t1).add(&t0);
        // 27. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 28. t4 ← b3 · t4
        t4 = b3.mul(&t4);
        // 29. t1 ← t1 + t2
        t1 = (&t1).add(&t2);
        // 30. t2 ← t0 − t2
        t2 = (&t0).sub(&t2);
        // 31. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 32. t4 ← t4 + t2
        t4 = (&t4).add(&t2);
        // 33. t0 ← t1 · t4
        t0 = (&t1).mul(&t4);
        // 34. Y3 ← Y3 + t0
        y3 = (&y3).add(&t0);
        // 35. t0 ← t5 · t4
        t0 = (&t5).mul(&t4);
        // 36. X3 ← t3 · X3
        x3 = (&t3).mul(&x3);
        // 37. X3 ← X3 − t0
        x3 = (&x3).sub(&t0);
        // 38. t0 ← t3 · t1
        t0 = (&t3).mul(&t1);
        // 39. Z3 ← t5 · Z3
        z3 = (&t5).mul(&z3);
        // 40. Z3 ← Z3 + t0
        z3 = (&z3).add(&t0);
        MontyProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_point_at_infinity(monty: &MontyKnowledge) -> MontyProjectivePoint {
        let x = BoxedMontyForm::zero(monty.params.clone());
        let y = BoxedMontyForm::one(monty.params.clone());
        let z = BoxedMontyForm::zero(monty.params.clone());
        MontyProjectivePoint { x, y, z }
    }

    fn internal_multiply_scalar_with_point(monty: &MontyKnowledge, scalar: &BoxedUint, point: &MontyProjectivePoint) -> MontyProjectivePoint {
        let mut result = Self::internal_point_at_infinity(monty);

        // walk the full precision so that the iteration count does not depend on the scalar
        let mut double_me = point.clone();
        for i in 0..scalar.bits_precision() {
            let sum = Self::internal_add_points(monty, &result, &double_me);
            result = if bool::from(scalar.bit(i)) { sum } else { result };
            double_me = Self::internal_double_point(monty, &double_me);
        }

        result
    }

    pub fn is_on_curve(&self, point: &AffinePoint) -> Choice {
        let projective = Self::internal_affine_to_monty_projective(&self.monty, point);
        Self::internal_is_on_curve(&self.monty, &projective)
    }

    /// Multiplies a point on the curve with a scalar.
    ///
    /// Returns `None` if the point is not on the curve or the result is the point at infinity.
    pub fn multiply_point(&self, scalar: &BoxedUint, point: &AffinePoint) -> Option<AffinePoint> {
        let projective = Self::internal_affine_to_monty_projective(&self.monty, point);
        if !bool::from(Self::internal_is_on_curve(&self.monty, &projective)) {
            return None;
        }
        let product = Self::internal_multiply_scalar_with_point(&self.monty, scalar, &projective);
        Option::from(Self::internal_monty_projective_to_affine(&product))
    }

    /// Adds two points on the curve.
    ///
    /// Returns `None` if the result is the point at infinity.
    pub fn add_points(&self, lhs: &AffinePoint, rhs: &AffinePoint) -> Option<AffinePoint> {
        let lhs_proj = Self::internal_affine_to_monty_projective(&self.monty, lhs);
        let rhs_proj = Self::internal_affine_to_monty_projective(&self.monty, rhs);
        let sum = Self::internal_add_points(&self.monty, &lhs_proj, &rhs_proj);
        Option::from(Self::internal_monty_projective_to_affine(&sum))
    }

    /// Calculates a public key from a private key.
    ///
    /// ```plain
    /// public_key = private_key * generator
    /// ```
    pub fn calculate_public_key(&self, private_key: &BoxedUint) -> Option<AffinePoint> {
        self.multiply_point(private_key, &self.generator)
    }

    /// Elliptic-curve Diffie-Hellman; the shared point is the private key multiplied by the other
    /// side's public key.
    ///
    /// Returns `None` if the other public key is not on the curve.
    pub fn diffie_hellman(&self, private_key: &BoxedUint, other_public_key: &AffinePoint) -> Option<AffinePoint> {
        self.multiply_point(private_key, other_public_key)
    }

    /// Derives the curve with the generator mapped by Generic Mapping.
    ///
    /// ```plain
    /// new_generator = (nonce * generator) + shared_point
    /// ```
    pub fn derive_generic_mapping_session_curve(&self, nonce: &BoxedUint, shared_point: &AffinePoint) -> Option<Self> {
        let generator_proj = Self::internal_affine_to_monty_projective(&self.monty, &self.generator);
        let shared_proj = Self::internal_affine_to_monty_projective(&self.monty, shared_point);
        if !bool::from(Self::internal_is_on_curve(&self.monty, &shared_proj)) {
            return None;
        }

        let product = Self::internal_multiply_scalar_with_point(&self.monty, nonce, &generator_proj);
        let sum = Self::internal_add_points(&self.monty, &product, &shared_proj);
        let new_generator = Option::from(Self::internal_monty_projective_to_affine(&sum))?;
        Some(self.with_generator(new_generator))
    }
}
impl fmt::Debug for PrimeWeierstrassCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimeWeierstrassCurve")
            .field("prime", &self.prime)
            .field("coefficient_a", &self.coefficient_a)
            .field("coefficient_b", &self.coefficient_b)
            .field("generator", &self.generator)
            .field("order", &self.order)
            .field("cofactor", &self.cofactor)
            .finish()
    }
}
impl PartialEq for PrimeWeierstrassCurve {
    fn eq(&self, other: &Self) -> bool {
        self.same_group_parameters(other)
            && self.generator == other.generator
    }
}
impl Eq for PrimeWeierstrassCurve {}
