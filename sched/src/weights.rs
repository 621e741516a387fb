// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sparse indexed weights and the operand math applied to them.
//!
//! [`IndexedData`] stores ascending (index, value) pairs.
//! [`IndexedWeightsOperand`] layers elementwise arithmetic, comparison and
//! range math over [`IndexedWeights`], with a set-operation tag deciding
//! how the index sets of binary operations merge: `Union` takes the outer
//! union (a missing side contributes an implicit zero weight), while
//! `Intersection` keeps only shared indices.

use vector::Value;

/// Ascending (index, value) pairs.
#[derive(Clone, Default, PartialEq, Debug)]
pub struct IndexedData<T> {
    indices: Vec<usize>,
    data: Vec<T>,
}

// === impl IndexedData ===

impl<T: Clone> IndexedData<T> {
    pub fn new() -> Self {
        Self {
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Appends an (index, data) pair. Indices must be added in strictly
    /// increasing order; a violation is reported and dropped.
    pub fn add(&mut self, index: usize, data: T) {
        if let Some(&last) = self.indices.last() {
            if index <= last {
                tracing::error!("indexed data must be added in sorted order");
                return;
            }
        }
        self.indices.push(index);
        self.data.push(data);
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn reserve(&mut self, n: usize) {
        self.indices.reserve(n);
        self.data.reserve(n);
    }

    /// The i-th index.
    pub fn index(&self, i: usize) -> usize {
        self.indices[i]
    }

    /// The i-th data value.
    pub fn data(&self, i: usize) -> &T {
        &self.data[i]
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[T] {
        &self.data
    }

    /// The position of the first entry whose index is at or after
    /// `current`, found by binary search. Returns `len()` if none.
    pub fn first_data_index(&self, current: usize) -> usize {
        self.indices.partition_point(|&i| i < current)
    }

    /// Like [`Self::first_data_index`], searching linearly from
    /// `start`. Callers iterating monotonically pass their last position
    /// to keep the scan short.
    pub fn first_data_index_from(&self, current: usize, start: usize) -> usize {
        (start..self.indices.len())
            .find(|&i| self.indices[i] >= current)
            .unwrap_or(self.indices.len())
    }

    /// Over-composition, strong over weak: the result's indices are the
    /// union, and where both sides carry data the strong side wins.
    pub fn compose(result: &mut Self, weak: &Self, strong: &Self) {
        if strong.is_empty() {
            result.indices.clone_from(&weak.indices);
            result.data.clone_from(&weak.data);
            return;
        }
        if weak.is_empty() {
            result.indices.clone_from(&strong.indices);
            result.data.clone_from(&strong.data);
            return;
        }

        // Clear but keep capacity; composition buffers are reused.
        result.indices.clear();
        result.data.clear();

        let (mut i, mut j) = (0, 0);
        while i < strong.len() || j < weak.len() {
            let s = strong.indices.get(i).copied();
            let w = weak.indices.get(j).copied();
            match (s, w) {
                (Some(si), Some(wi)) if wi < si => {
                    result.indices.push(wi);
                    result.data.push(weak.data[j].clone());
                    j += 1;
                }
                (Some(si), other) => {
                    result.indices.push(si);
                    result.data.push(strong.data[i].clone());
                    i += 1;
                    if other == Some(si) {
                        j += 1;
                    }
                }
                (None, Some(wi)) => {
                    result.indices.push(wi);
                    result.data.push(weak.data[j].clone());
                    j += 1;
                }
                (None, None) => break,
            }
        }
    }

    fn parts_mut(&mut self) -> (&mut Vec<usize>, &mut Vec<T>) {
        (&mut self.indices, &mut self.data)
    }
}

impl<T> std::ops::Index<usize> for IndexedData<T> {
    type Output = T;

    fn index(&self, i: usize) -> &T {
        &self.data[i]
    }
}

impl<T> std::ops::IndexMut<usize> for IndexedData<T> {
    fn index_mut(&mut self, i: usize) -> &mut T {
        &mut self.data[i]
    }
}

/// Sparse per-element weights.
pub type IndexedWeights = IndexedData<f32>;

impl Value for IndexedWeights {}

/// The set operation applied to the index sets of binary weight
/// operations.
///
/// The operation that combines the weights and the operation that merges
/// the index sets are independent; for convenience the set operation is
/// part of the operand, so all operands in one expression must agree.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetOperation {
    Union,
    Intersection,
}

const MATH_ERROR: f32 = f32::NAN;

fn is_math_error(value: f32) -> bool {
    value.is_nan() || value.is_infinite()
}

/// Weights under computation.
///
/// The weights data may be externally referenced to avoid copying inputs;
/// the operand must then not outlive the referenced weights. Operands are
/// transient objects: expressions combine them and the result is stored
/// back as plain [`IndexedWeights`].
///
/// A `may_have_math_errors` flag rides along across operations as the
/// fast path for [`Self::num_math_errors`] and [`Self::clear_math_errors`].
#[derive(Clone)]
pub struct IndexedWeightsOperand<'w> {
    weights: IndexedWeights,
    set_operation: SetOperation,
    external: Option<&'w IndexedWeights>,
    may_have_math_errors: bool,
}

// === impl IndexedWeightsOperand ===

impl<'w> IndexedWeightsOperand<'w> {
    pub fn new(set_operation: SetOperation) -> Self {
        Self {
            weights: IndexedWeights::new(),
            set_operation,
            external: None,
            may_have_math_errors: false,
        }
    }

    /// An operand referencing `external` without copying it. The operand
    /// does not take ownership; see the type-level docs for lifetime
    /// rules.
    pub fn with_external(
        set_operation: SetOperation,
        external: &'w IndexedWeights,
    ) -> Self {
        Self {
            weights: IndexedWeights::new(),
            set_operation,
            external: Some(external),
            may_have_math_errors: false,
        }
    }

    pub fn set_operation(&self) -> SetOperation {
        self.set_operation
    }

    pub fn has_external_weights(&self) -> bool {
        self.external.is_some()
    }

    pub fn len(&self) -> usize {
        self.read_indices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_indices().is_empty()
    }

    pub fn index(&self, i: usize) -> usize {
        self.read_indices()[i]
    }

    pub fn weight(&self, i: usize) -> f32 {
        self.read_weights()[i]
    }

    fn read_indices(&self) -> &[usize] {
        match self.external {
            Some(external) => external.indices(),
            None => self.weights.indices(),
        }
    }

    fn read_weights(&self) -> &[f32] {
        match self.external {
            Some(external) => external.values(),
            None => self.weights.values(),
        }
    }

    // Makes a local, mutable copy of the external weights.
    fn copy_external(&mut self) {
        if let Some(external) = self.external.take() {
            self.weights = external.clone();
        }
    }

    /// Swaps the held weights with `v`, copying external weights first.
    pub fn swap(&mut self, v: &mut IndexedWeights) {
        self.copy_external();
        let (indices, data) = self.weights.parts_mut();
        let (v_indices, v_data) = v.parts_mut();
        std::mem::swap(indices, v_indices);
        std::mem::swap(data, v_data);
    }

    /// Resolves the operand into plain weights.
    pub fn into_weights(mut self) -> IndexedWeights {
        self.copy_external();
        self.weights
    }

    /// The number of weights that are NaN or infinite. Cheap when the
    /// error flag is clear.
    pub fn num_math_errors(&self) -> usize {
        if !self.may_have_math_errors {
            return 0;
        }
        self.read_weights()
            .iter()
            .filter(|w| is_math_error(**w))
            .count()
    }

    /// Replaces NaN and infinite weights with 0.
    pub fn clear_math_errors(&mut self) {
        if !self.may_have_math_errors {
            return;
        }
        self.copy_external();
        for w in &mut self.weights.parts_mut().1[..] {
            if is_math_error(*w) {
                *w = 0.0;
            }
        }
        self.may_have_math_errors = false;
    }

    /// Removes indices according to the set operation and the weights in
    /// `operands`: with `Union`, an index survives if any operand weight
    /// at it is non-zero; with `Intersection`, an index survives only if
    /// every matching operand weight is non-zero. The operand's own
    /// weight values do not participate.
    pub fn prune_zeros(&mut self, operands: &[Self]) {
        debug_assert!(
            operands
                .iter()
                .all(|o| o.set_operation == self.set_operation)
        );

        self.copy_external();
        let set_operation = self.set_operation;
        let (indices, weights) = self.weights.parts_mut();

        let mut positions = vec![0usize; operands.len()];
        let mut skipped = 0usize;

        for i in 0..indices.len() {
            let index = indices[i];

            let mut num_matching = 0usize;
            let mut num_non_zero = 0usize;
            for (n, operand) in operands.iter().enumerate() {
                let ops_indices = operand.read_indices();
                let ops_weights = operand.read_weights();
                let j = &mut positions[n];
                while *j < ops_indices.len() && ops_indices[*j] < index {
                    *j += 1;
                }
                if *j < ops_indices.len() && ops_indices[*j] == index {
                    num_matching += 1;
                    if ops_weights[*j] != 0.0 {
                        num_non_zero += 1;
                    }
                }
            }

            let skip = match set_operation {
                SetOperation::Union => num_non_zero == 0,
                SetOperation::Intersection => num_non_zero < num_matching,
            };
            if skip {
                skipped += 1;
            } else if skipped > 0 {
                indices[i - skipped] = indices[i];
                weights[i - skipped] = weights[i];
            }
        }

        let len = indices.len() - skipped;
        indices.truncate(len);
        weights.truncate(len);
    }

    /// Replaces this operand's contents with `fill_weight` at the indices
    /// selected from `operands` by the set operation. With
    /// `non_zero_set_operation`, zero-weighted operand entries do not
    /// count as present.
    pub fn fill(&mut self, operands: &[Self], fill_weight: f32, non_zero_set_operation: bool) {
        debug_assert!(
            operands
                .iter()
                .all(|o| o.set_operation == self.set_operation)
        );

        // Previous contents, external ones included, are discarded.
        self.external = None;
        let set_operation = self.set_operation;
        let (indices, weights) = self.weights.parts_mut();
        indices.clear();
        weights.clear();

        let mut positions = vec![0usize; operands.len()];
        loop {
            // The smallest index any operand still has to offer.
            let Some(index) = operands
                .iter()
                .zip(&positions)
                .filter_map(|(o, &j)| o.read_indices().get(j).copied())
                .min()
            else {
                break;
            };

            let mut num_matching = 0usize;
            let mut num_non_zero = 0usize;
            for (n, operand) in operands.iter().enumerate() {
                let ops_indices = operand.read_indices();
                let j = &mut positions[n];
                if *j < ops_indices.len() && ops_indices[*j] == index {
                    num_matching += 1;
                    if operand.read_weights()[*j] != 0.0 {
                        num_non_zero += 1;
                    }
                    *j += 1;
                }
            }

            let add = if non_zero_set_operation {
                match set_operation {
                    SetOperation::Union => num_non_zero > 0,
                    SetOperation::Intersection => num_non_zero == num_matching,
                }
            } else {
                set_operation == SetOperation::Union
                    || num_matching == operands.len()
            };
            if add {
                indices.push(index);
                weights.push(fill_weight);
            }
        }
    }

    /// Merges two operands, combining the weights with `f`. A side
    /// missing an index contributes an implicit 0 weight under `Union`;
    /// under `Intersection` only shared indices survive.
    fn combine(
        &self,
        v: &IndexedWeightsOperand<'_>,
        f: impl Fn(f32, f32) -> f32,
    ) -> IndexedWeightsOperand<'static> {
        debug_assert_eq!(self.set_operation, v.set_operation);
        let union = self.set_operation == SetOperation::Union;

        let mut w = IndexedWeightsOperand::new(self.set_operation);
        let (indices0, weights0) = (self.read_indices(), self.read_weights());
        let (indices1, weights1) = (v.read_indices(), v.read_weights());

        let (dst_indices, dst_weights) = w.weights.parts_mut();
        dst_indices.reserve(indices0.len());
        dst_weights.reserve(indices0.len());

        let (mut i, mut j) = (0, 0);
        loop {
            match (indices0.get(i).copied(), indices1.get(j).copied()) {
                (Some(i0), Some(i1)) if i0 == i1 => {
                    dst_indices.push(i0);
                    dst_weights.push(f(weights0[i], weights1[j]));
                    i += 1;
                    j += 1;
                }
                (Some(i0), i1) if i1.is_none_or(|i1| i0 < i1) => {
                    if union {
                        dst_indices.push(i0);
                        dst_weights.push(f(weights0[i], 0.0));
                    }
                    i += 1;
                }
                (_, Some(i1)) => {
                    if union {
                        dst_indices.push(i1);
                        dst_weights.push(f(0.0, weights1[j]));
                    }
                    j += 1;
                }
                (None, None) => break,
                // The guard above makes this arm unreachable.
                (Some(_), None) => unreachable!(),
            }
        }

        w.may_have_math_errors = self.may_have_math_errors | v.may_have_math_errors;
        w
    }

    /// A copy with `f` applied to every weight. With `check_errors`, the
    /// results are scanned for NaN/infinity and the error flag set.
    fn apply(
        &self,
        check_errors: bool,
        mut f: impl FnMut(f32) -> f32,
    ) -> IndexedWeightsOperand<'static> {
        let mut copy = IndexedWeightsOperand::new(self.set_operation);
        copy.weights = IndexedData {
            indices: self.read_indices().to_vec(),
            data: self.read_weights().to_vec(),
        };
        copy.may_have_math_errors = self.may_have_math_errors;

        let may_errors = &mut copy.may_have_math_errors;
        for w in &mut copy.weights.data[..] {
            *w = f(*w);
            if check_errors && !*may_errors {
                *may_errors = is_math_error(*w);
            }
        }
        copy
    }

    /// Elementwise division. A missing denominator yields a NaN math
    /// error (under `Union`); a missing numerator yields 0.
    pub fn divide(&self, v: &IndexedWeightsOperand<'_>) -> IndexedWeightsOperand<'static> {
        debug_assert_eq!(self.set_operation, v.set_operation);
        let union = self.set_operation == SetOperation::Union;

        let mut w = IndexedWeightsOperand::new(self.set_operation);
        let (indices0, weights0) = (self.read_indices(), self.read_weights());
        let (indices1, weights1) = (v.read_indices(), v.read_weights());

        let mut errors = false;
        {
            let (dst_indices, dst_weights) = w.weights.parts_mut();
            let (mut i, mut j) = (0, 0);
            loop {
                match (indices0.get(i).copied(), indices1.get(j).copied()) {
                    (Some(i0), Some(i1)) if i0 == i1 => {
                        dst_indices.push(i0);
                        if weights1[j] != 0.0 {
                            dst_weights.push(weights0[i] / weights1[j]);
                        } else {
                            dst_weights.push(MATH_ERROR);
                            errors = true;
                        }
                        i += 1;
                        j += 1;
                    }
                    (Some(i0), i1) if i1.is_none_or(|i1| i0 < i1) => {
                        if union {
                            dst_indices.push(i0);
                            dst_weights.push(MATH_ERROR);
                            errors = true;
                        }
                        i += 1;
                    }
                    (_, Some(i1)) => {
                        if union {
                            dst_indices.push(i1);
                            dst_weights.push(0.0);
                        }
                        j += 1;
                    }
                    (None, None) => break,
                    (Some(_), None) => unreachable!(),
                }
            }
        }

        w.may_have_math_errors =
            errors | self.may_have_math_errors | v.may_have_math_errors;
        w
    }

    /// Comparisons yielding 0/1 weights.
    pub fn less_than(&self, v: &Self) -> Self {
        self.combine(v, |a, b| unit_weight(a < b))
    }

    pub fn less_equal(&self, v: &Self) -> Self {
        self.combine(v, |a, b| unit_weight(a <= b))
    }

    pub fn greater_than(&self, v: &Self) -> Self {
        v.less_than(self)
    }

    pub fn greater_equal(&self, v: &Self) -> Self {
        v.less_equal(self)
    }

    pub fn equal_to(&self, v: &Self) -> Self {
        self.combine(v, |a, b| unit_weight(a == b))
    }

    pub fn not_equal(&self, v: &Self) -> Self {
        self.combine(v, |a, b| unit_weight(a != b))
    }

    /// Scalar comparisons keep this operand's index set unchanged.
    pub fn less_than_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a < x))
    }

    pub fn less_equal_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a <= x))
    }

    pub fn greater_than_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a > x))
    }

    pub fn greater_equal_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a >= x))
    }

    pub fn equal_to_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a == x))
    }

    pub fn not_equal_scalar(&self, x: f32) -> Self {
        self.apply(false, |a| unit_weight(a != x))
    }

    /// Unary math. Functions whose domain excludes part of the real line
    /// scan their results for math errors.
    pub fn acos(&self) -> Self {
        self.apply(true, f32::acos)
    }

    pub fn acosh(&self) -> Self {
        self.apply(true, f32::acosh)
    }

    pub fn asin(&self) -> Self {
        self.apply(true, f32::asin)
    }

    pub fn asinh(&self) -> Self {
        self.apply(false, f32::asinh)
    }

    pub fn atan(&self) -> Self {
        self.apply(false, f32::atan)
    }

    pub fn atanh(&self) -> Self {
        self.apply(true, f32::atanh)
    }

    pub fn atan2(&self, v: &Self) -> Self {
        self.combine(v, f32::atan2)
    }

    pub fn ceil(&self) -> Self {
        self.apply(false, f32::ceil)
    }

    pub fn cos(&self) -> Self {
        self.apply(false, f32::cos)
    }

    pub fn cosh(&self) -> Self {
        self.apply(false, f32::cosh)
    }

    pub fn exp(&self) -> Self {
        self.apply(false, f32::exp)
    }

    pub fn fabs(&self) -> Self {
        self.apply(false, f32::abs)
    }

    pub fn floor(&self) -> Self {
        self.apply(false, f32::floor)
    }

    pub fn fmod(&self, denominator: f32) -> Self {
        // A zero denominator must still yield NaNs at the right indices,
        // so there is no early out.
        self.apply(true, |x| x % denominator)
    }

    pub fn log(&self) -> Self {
        self.apply(true, f32::ln)
    }

    pub fn log10(&self) -> Self {
        self.apply(true, f32::log10)
    }

    pub fn pow(&self, exponent: f32) -> Self {
        self.apply(true, |x| x.powf(exponent))
    }

    pub fn sin(&self) -> Self {
        self.apply(false, f32::sin)
    }

    pub fn sinh(&self) -> Self {
        self.apply(false, f32::sinh)
    }

    pub fn sqrt(&self) -> Self {
        self.apply(true, f32::sqrt)
    }

    pub fn tan(&self) -> Self {
        self.apply(true, f32::tan)
    }

    pub fn tanh(&self) -> Self {
        self.apply(false, f32::tanh)
    }

    /// Elementwise minimum against another operand.
    pub fn min(&self, v: &Self) -> Self {
        self.combine(v, f32::min)
    }

    /// Elementwise maximum against another operand.
    pub fn max(&self, v: &Self) -> Self {
        self.combine(v, f32::max)
    }

    pub fn min_scalar(&self, min: f32) -> Self {
        self.apply(false, |x| x.min(min))
    }

    pub fn max_scalar(&self, max: f32) -> Self {
        self.apply(false, |x| x.max(max))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Self {
        self.apply(false, |x| x.clamp(min, max))
    }

    /// Hermite step between `min` and `max` with end slopes `slope0` and
    /// `slope1`.
    pub fn smoothstep(&self, min: f32, max: f32, slope0: f32, slope1: f32) -> Self {
        self.apply(false, |x| smooth_step(min, max, x, slope0, slope1))
    }

    /// Linear ramp between `min` and `max` with smooth shoulders of the
    /// given lengths (as fractions of the interval).
    pub fn smoothramp(
        &self,
        min: f32,
        max: f32,
        shoulder0: f32,
        shoulder1: f32,
    ) -> Self {
        self.apply(false, |x| smooth_ramp(min, max, x, shoulder0, shoulder1))
    }

    /// Lerps every weight from itself towards `v` by the scalar `a`.
    pub fn lerp(&self, v: &Self, a: f32) -> Self {
        self.combine(v, |x, y| lerp(a, x, y))
    }

    /// Lerps every weight from itself towards `v` by the per-index
    /// weights of `a`; missing sides contribute zero.
    pub fn lerp_weights(
        &self,
        v: &IndexedWeightsOperand<'_>,
        a: &IndexedWeightsOperand<'_>,
    ) -> IndexedWeightsOperand<'static> {
        debug_assert_eq!(self.set_operation, v.set_operation);
        debug_assert_eq!(self.set_operation, a.set_operation);
        let union = self.set_operation == SetOperation::Union;

        let mut w = IndexedWeightsOperand::new(self.set_operation);
        let streams = [
            (self.read_indices(), self.read_weights()),
            (v.read_indices(), v.read_weights()),
            (a.read_indices(), a.read_weights()),
        ];

        {
            let (dst_indices, dst_weights) = w.weights.parts_mut();
            let mut pos = [0usize; 3];
            loop {
                let Some(index) = streams
                    .iter()
                    .zip(&pos)
                    .filter_map(|((indices, _), &p)| indices.get(p).copied())
                    .min()
                else {
                    break;
                };

                let mut values = [0.0f32; 3];
                let mut matched = 0;
                for (n, (indices, weights)) in streams.iter().enumerate() {
                    if indices.get(pos[n]).copied() == Some(index) {
                        values[n] = weights[pos[n]];
                        pos[n] += 1;
                        matched += 1;
                    }
                }

                if union || matched == 3 {
                    dst_indices.push(index);
                    dst_weights.push(lerp(values[2], values[0], values[1]));
                }
            }
        }

        w.may_have_math_errors =
            self.may_have_math_errors | v.may_have_math_errors | a.may_have_math_errors;
        w
    }
}

impl std::ops::Neg for &IndexedWeightsOperand<'_> {
    type Output = IndexedWeightsOperand<'static>;

    fn neg(self) -> Self::Output {
        self * -1.0
    }
}

impl<'a> std::ops::Add for &IndexedWeightsOperand<'a> {
    type Output = IndexedWeightsOperand<'static>;

    fn add(self, v: Self) -> Self::Output {
        self.combine(v, |a, b| a + b)
    }
}

impl<'a> std::ops::Sub for &IndexedWeightsOperand<'a> {
    type Output = IndexedWeightsOperand<'static>;

    fn sub(self, v: Self) -> Self::Output {
        self.combine(v, |a, b| a - b)
    }
}

impl<'a> std::ops::Mul for &IndexedWeightsOperand<'a> {
    type Output = IndexedWeightsOperand<'static>;

    fn mul(self, v: Self) -> Self::Output {
        self.combine(v, |a, b| a * b)
    }
}

impl<'a> std::ops::Div for &IndexedWeightsOperand<'a> {
    type Output = IndexedWeightsOperand<'static>;

    fn div(self, v: Self) -> Self::Output {
        self.divide(v)
    }
}

impl std::ops::Add<f32> for &IndexedWeightsOperand<'_> {
    type Output = IndexedWeightsOperand<'static>;

    fn add(self, s: f32) -> Self::Output {
        if s == 0.0 {
            return self.apply(false, |x| x);
        }
        self.apply(false, |x| x + s)
    }
}

impl std::ops::Sub<f32> for &IndexedWeightsOperand<'_> {
    type Output = IndexedWeightsOperand<'static>;

    fn sub(self, s: f32) -> Self::Output {
        self + (-s)
    }
}

impl std::ops::Mul<f32> for &IndexedWeightsOperand<'_> {
    type Output = IndexedWeightsOperand<'static>;

    fn mul(self, s: f32) -> Self::Output {
        if s == 1.0 {
            return self.apply(false, |x| x);
        }
        self.apply(false, |x| x * s)
    }
}

impl std::ops::Div<f32> for &IndexedWeightsOperand<'_> {
    type Output = IndexedWeightsOperand<'static>;

    fn div(self, s: f32) -> Self::Output {
        if s == 0.0 {
            let mut w = self.apply(false, |_| MATH_ERROR);
            w.may_have_math_errors = true;
            return w;
        }
        let inv = 1.0 / s;
        self.apply(false, |x| x * inv)
    }
}

impl std::ops::Add<&IndexedWeightsOperand<'_>> for f32 {
    type Output = IndexedWeightsOperand<'static>;

    fn add(self, v: &IndexedWeightsOperand<'_>) -> Self::Output {
        v + self
    }
}

impl std::ops::Sub<&IndexedWeightsOperand<'_>> for f32 {
    type Output = IndexedWeightsOperand<'static>;

    fn sub(self, v: &IndexedWeightsOperand<'_>) -> Self::Output {
        v.apply(false, |x| self - x)
    }
}

impl std::ops::Mul<&IndexedWeightsOperand<'_>> for f32 {
    type Output = IndexedWeightsOperand<'static>;

    fn mul(self, v: &IndexedWeightsOperand<'_>) -> Self::Output {
        v * self
    }
}

impl std::ops::Div<&IndexedWeightsOperand<'_>> for f32 {
    type Output = IndexedWeightsOperand<'static>;

    fn div(self, v: &IndexedWeightsOperand<'_>) -> Self::Output {
        let mut errors = false;
        let mut w = v.apply(false, |x| {
            if x != 0.0 {
                self / x
            } else {
                errors = true;
                MATH_ERROR
            }
        });
        w.may_have_math_errors |= errors;
        w
    }
}

fn unit_weight(condition: bool) -> f32 {
    if condition { 1.0 } else { 0.0 }
}

fn lerp(alpha: f32, a: f32, b: f32) -> f32 {
    (1.0 - alpha) * a + alpha * b
}

/// Cubic Hermite step: 0 below `min`, 1 above `max`, endpoint derivatives
/// `slope0` and `slope1`.
fn smooth_step(min: f32, max: f32, value: f32, slope0: f32, slope1: f32) -> f32 {
    if value < min {
        return 0.0;
    }
    if value >= max {
        return 1.0;
    }
    let t = (value - min) / (max - min);
    let t2 = t * t;
    let t3 = t2 * t;
    (t3 - 2.0 * t2 + t) * slope0 + (-2.0 * t3 + 3.0 * t2) + (t3 - t2) * slope1
}

/// Piecewise ramp: quadratic ease-in over `shoulder0`, linear middle,
/// quadratic ease-out over `shoulder1` (both as fractions of the
/// normalized interval).
fn smooth_ramp(min: f32, max: f32, value: f32, shoulder0: f32, shoulder1: f32) -> f32 {
    if value <= min {
        return 0.0;
    }
    if value >= max {
        return 1.0;
    }
    let t = (value - min) / (max - min);
    let a = shoulder0.clamp(0.0, 1.0);
    let b = shoulder1.clamp(0.0, 1.0 - a);
    let slope = 2.0 / (2.0 - a - b);

    if t < a {
        slope * t * t / (2.0 * a)
    } else if t > 1.0 - b {
        1.0 - slope * (1.0 - t) * (1.0 - t) / (2.0 * b)
    } else {
        slope * (t - a / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(usize, f32)]) -> IndexedWeights {
        let mut w = IndexedWeights::new();
        for &(i, v) in pairs {
            w.add(i, v);
        }
        w
    }

    fn operand(set_op: SetOperation, pairs: &[(usize, f32)]) -> IndexedWeightsOperand<'static> {
        let mut o = IndexedWeightsOperand::new(set_op);
        let mut w = weights(pairs);
        o.swap(&mut w);
        o
    }

    fn pairs(o: &IndexedWeightsOperand<'_>) -> Vec<(usize, f32)> {
        (0..o.len()).map(|i| (o.index(i), o.weight(i))).collect()
    }

    #[test]
    fn indexed_data_ordering() {
        let mut d = IndexedWeights::new();
        d.add(3, 1.0);
        d.add(7, 2.0);
        // Out-of-order adds are reported and dropped.
        d.add(5, 9.0);
        assert_eq!(d.indices(), &[3, 7]);

        assert_eq!(d.first_data_index(4), 1);
        assert_eq!(d.first_data_index(8), 2);
        assert_eq!(d.first_data_index_from(4, 1), 1);
    }

    #[test]
    fn compose_strong_over_weak() {
        let weak = weights(&[(0, 1.0), (2, 2.0), (5, 3.0)]);
        let strong = weights(&[(2, 9.0), (3, 8.0)]);
        let mut result = IndexedWeights::new();
        IndexedData::compose(&mut result, &weak, &strong);

        assert_eq!(result.indices(), &[0, 2, 3, 5]);
        assert_eq!(result.values(), &[1.0, 9.0, 8.0, 3.0]);
    }

    #[test]
    fn union_addition_takes_outer_indices() {
        let a = operand(SetOperation::Union, &[(0, 1.0), (4, 2.0)]);
        let b = operand(SetOperation::Union, &[(4, 3.0), (9, 5.0)]);
        assert_eq!(pairs(&(&a + &b)), vec![(0, 1.0), (4, 5.0), (9, 5.0)]);
        // Subtraction negates the missing left side.
        assert_eq!(pairs(&(&a - &b)), vec![(0, 1.0), (4, -1.0), (9, -5.0)]);
        // Multiplication contributes zero for a missing side.
        assert_eq!(pairs(&(&a * &b)), vec![(0, 0.0), (4, 6.0), (9, 0.0)]);
    }

    #[test]
    fn intersection_keeps_shared_indices() {
        let a = operand(SetOperation::Intersection, &[(0, 1.0), (4, 2.0)]);
        let b = operand(SetOperation::Intersection, &[(4, 3.0), (9, 5.0)]);
        assert_eq!(pairs(&(&a + &b)), vec![(4, 5.0)]);
        assert_eq!(pairs(&(&a * &b)), vec![(4, 6.0)]);
    }

    #[test]
    fn division_flags_missing_denominators() {
        let a = operand(SetOperation::Union, &[(1, 4.0), (3, 9.0)]);
        let b = operand(SetOperation::Union, &[(1, 2.0), (7, 5.0)]);
        let q = &a / &b;

        assert_eq!(q.index(0), 1);
        assert_eq!(q.weight(0), 2.0);
        // Index 3 has no denominator: a math error.
        assert!(q.weight(1).is_nan());
        // Index 7 has no numerator: zero.
        assert_eq!(q.weight(2), 0.0);

        assert_eq!(q.num_math_errors(), 1);
        let mut q = q;
        q.clear_math_errors();
        assert_eq!(q.weight(1), 0.0);
        assert_eq!(q.num_math_errors(), 0);
    }

    #[test]
    fn comparisons_yield_unit_weights() {
        let a = operand(SetOperation::Union, &[(0, 1.0), (2, -3.0)]);
        let b = operand(SetOperation::Union, &[(0, 2.0), (5, 4.0)]);

        // Missing sides compare against zero.
        assert_eq!(
            pairs(&a.less_than(&b)),
            vec![(0, 1.0), (2, 1.0), (5, 1.0)]
        );
        assert_eq!(pairs(&a.greater_equal_scalar(1.0)), vec![(0, 1.0), (2, 0.0)]);
    }

    #[test]
    fn math_error_flag_propagates() {
        let a = operand(SetOperation::Union, &[(0, -1.0)]);
        let sq = a.sqrt();
        assert_eq!(sq.num_math_errors(), 1);

        // Errors ride through further operations via the flag.
        let sum = &sq + &operand(SetOperation::Union, &[(0, 1.0)]);
        assert_eq!(sum.num_math_errors(), 1);

        // Error-free functions do not scan.
        let s = a.sin();
        assert_eq!(s.num_math_errors(), 0);
    }

    #[test]
    fn scalar_arithmetic() {
        let a = operand(SetOperation::Union, &[(1, 2.0), (3, 4.0)]);
        assert_eq!(pairs(&(&a * 2.0)), vec![(1, 4.0), (3, 8.0)]);
        assert_eq!(pairs(&(&a - 1.0)), vec![(1, 1.0), (3, 3.0)]);
        assert_eq!(pairs(&(10.0 - &a)), vec![(1, 8.0), (3, 6.0)]);

        let div = &a / 0.0;
        assert_eq!(div.num_math_errors(), 2);

        let inv = 8.0 / &a;
        assert_eq!(pairs(&inv), vec![(1, 4.0), (3, 2.0)]);
    }

    #[test]
    fn range_functions() {
        let a = operand(SetOperation::Union, &[(0, -1.0), (1, 0.5), (2, 2.0)]);
        assert_eq!(
            pairs(&a.clamp(0.0, 1.0)),
            vec![(0, 0.0), (1, 0.5), (2, 1.0)]
        );

        let s = a.smoothstep(0.0, 1.0, 0.0, 0.0);
        assert_eq!(s.weight(0), 0.0);
        assert_eq!(s.weight(1), 0.5);
        assert_eq!(s.weight(2), 1.0);

        let b = operand(SetOperation::Union, &[(0, 1.0), (1, 1.0), (2, 1.0)]);
        let l = a.lerp(&b, 0.5);
        assert_eq!(pairs(&l), vec![(0, 0.0), (1, 0.75), (2, 1.5)]);

        // min/max against the implicit zero of a missing side.
        let c = operand(SetOperation::Union, &[(5, -2.0)]);
        assert_eq!(pairs(&a.min(&c))[3], (5, -2.0));
        assert_eq!(pairs(&a.max(&c))[3], (5, 0.0));
    }

    #[test]
    fn lerp_with_weight_alpha() {
        let a = operand(SetOperation::Union, &[(0, 2.0), (1, 2.0)]);
        let b = operand(SetOperation::Union, &[(0, 4.0), (2, 4.0)]);
        let alpha = operand(SetOperation::Union, &[(0, 0.5), (2, 0.5)]);

        let l = a.lerp_weights(&b, &alpha);
        // Index 0: lerp(0.5, 2, 4); index 1: alpha missing, keeps a;
        // index 2: lerp(0.5, 0, 4).
        assert_eq!(pairs(&l), vec![(0, 3.0), (1, 2.0), (2, 2.0)]);
    }

    #[test]
    fn prune_zeros_union_and_intersection() {
        let operands = vec![
            operand(SetOperation::Union, &[(0, 0.0), (1, 1.0), (2, 0.0)]),
            operand(SetOperation::Union, &[(0, 0.0), (2, 2.0)]),
        ];
        let mut w = operand(SetOperation::Union, &[(0, 9.0), (1, 9.0), (2, 9.0)]);
        w.prune_zeros(&operands);
        // Index 0 is zero in every operand and gets pruned.
        assert_eq!(pairs(&w), vec![(1, 9.0), (2, 9.0)]);

        let operands = vec![
            operand(SetOperation::Intersection, &[(0, 1.0), (1, 1.0), (2, 0.0)]),
            operand(SetOperation::Intersection, &[(0, 0.0), (1, 1.0), (2, 1.0)]),
        ];
        let mut w =
            operand(SetOperation::Intersection, &[(0, 9.0), (1, 9.0), (2, 9.0)]);
        w.prune_zeros(&operands);
        // Any zero operand weight kills the index.
        assert_eq!(pairs(&w), vec![(1, 9.0)]);
    }

    #[test]
    fn fill_selects_indices_by_set_operation() {
        let operands = vec![
            operand(SetOperation::Union, &[(0, 1.0), (1, 0.0)]),
            operand(SetOperation::Union, &[(1, 2.0), (3, 0.0)]),
        ];
        let mut w = operand(SetOperation::Union, &[]);
        w.fill(&operands, 5.0, false);
        assert_eq!(pairs(&w), vec![(0, 5.0), (1, 5.0), (3, 5.0)]);

        w.fill(&operands, 5.0, true);
        // Non-zero filter drops index 3 (all zero) but keeps 1.
        assert_eq!(pairs(&w), vec![(0, 5.0), (1, 5.0)]);

        let operands = vec![
            operand(SetOperation::Intersection, &[(0, 1.0), (1, 1.0)]),
            operand(SetOperation::Intersection, &[(1, 1.0), (3, 1.0)]),
        ];
        let mut w = operand(SetOperation::Intersection, &[]);
        w.fill(&operands, 2.0, false);
        assert_eq!(pairs(&w), vec![(1, 2.0)]);
    }

    #[test]
    fn external_weights_copy_on_write() {
        let external = weights(&[(0, 1.0), (5, 2.0)]);
        let o = IndexedWeightsOperand::with_external(SetOperation::Union, &external);
        assert!(o.has_external_weights());
        assert_eq!(o.len(), 2);

        let doubled = &o * 2.0;
        assert!(!doubled.has_external_weights());
        assert_eq!(doubled.weight(1), 4.0);
        // The external weights are untouched.
        assert_eq!(*external.data(1), 2.0);
    }
}
