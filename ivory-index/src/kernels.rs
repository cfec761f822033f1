// Copyright 2026 The ivory Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Distance and accumulation kernels over raw element-typed byte slices.
//!
//! Vectors live on disk as packed little-endian elements, so every kernel
//! takes `&[u8]` plus the element type and dimension and widens to `f64`
//! for accumulation. The compiler auto-vectorises these simple loops; the
//! split into `read`-per-index keeps them free of alignment assumptions
//! about mmapped storage.

use half::f16;

use ivory_core::{ElementType, Error, KnnMetric, Result};

/// One vector element as stored on disk.
pub trait Scalar: Copy + std::fmt::Display {
    const BYTES: usize;
    fn read(bytes: &[u8], index: usize) -> Self;
    fn write(self, bytes: &mut [u8], index: usize);
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl Scalar for f32 {
    const BYTES: usize = 4;

    #[inline]
    fn read(bytes: &[u8], index: usize) -> Self {
        f32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[inline]
    fn write(self, bytes: &mut [u8], index: usize) {
        bytes[index * 4..index * 4 + 4].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Scalar for f16 {
    const BYTES: usize = 2;

    #[inline]
    fn read(bytes: &[u8], index: usize) -> Self {
        f16::from_le_bytes(bytes[index * 2..index * 2 + 2].try_into().unwrap())
    }

    #[inline]
    fn write(self, bytes: &mut [u8], index: usize) {
        bytes[index * 2..index * 2 + 2].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl Scalar for u8 {
    const BYTES: usize = 1;

    #[inline]
    fn read(bytes: &[u8], index: usize) -> Self {
        bytes[index]
    }

    #[inline]
    fn write(self, bytes: &mut [u8], index: usize) {
        bytes[index] = self;
    }

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as u8
    }
}

macro_rules! dispatch {
    ($elem:expr, $func:ident($($arg:expr),*)) => {
        match $elem {
            ElementType::F32 => $func::<f32>($($arg),*),
            ElementType::F16 => $func::<f16>($($arg),*),
            ElementType::U8 => $func::<u8>($($arg),*),
        }
    };
}

fn l1_t<T: Scalar>(a: &[u8], b: &[u8], dim: usize) -> f64 {
    let mut dist = 0.0;
    for i in 0..dim {
        dist += (T::read(a, i).to_f64() - T::read(b, i).to_f64()).abs();
    }
    dist
}

fn l2_sq_t<T: Scalar>(a: &[u8], b: &[u8], dim: usize) -> f64 {
    let mut dist = 0.0;
    for i in 0..dim {
        let diff = T::read(a, i).to_f64() - T::read(b, i).to_f64();
        dist += diff * diff;
    }
    dist
}

fn cosine_t<T: Scalar>(a: &[u8], b: &[u8], dim: usize) -> f64 {
    let mut dot = 0.0;
    let mut a_norm = 0.0;
    let mut b_norm = 0.0;
    for i in 0..dim {
        let x = T::read(a, i).to_f64();
        let y = T::read(b, i).to_f64();
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}

pub fn l1(elem: ElementType, a: &[u8], b: &[u8], dim: usize) -> f64 {
    dispatch!(elem, l1_t(a, b, dim))
}

pub fn l2(elem: ElementType, a: &[u8], b: &[u8], dim: usize) -> f64 {
    l2_sq(elem, a, b, dim).sqrt()
}

pub fn l2_sq(elem: ElementType, a: &[u8], b: &[u8], dim: usize) -> f64 {
    dispatch!(elem, l2_sq_t(a, b, dim))
}

pub fn cosine(elem: ElementType, a: &[u8], b: &[u8], dim: usize) -> f64 {
    dispatch!(elem, cosine_t(a, b, dim))
}

pub fn distance(metric: KnnMetric, elem: ElementType, a: &[u8], b: &[u8], dim: usize) -> f64 {
    match metric {
        KnnMetric::L1 => l1(elem, a, b, dim),
        KnnMetric::L2 => l2(elem, a, b, dim),
        KnnMetric::Cosine => cosine(elem, a, b, dim),
    }
}

fn sum_into_t<T: Scalar>(v: &[u8], sums: &mut [f64], dim: usize) {
    for (i, sum) in sums.iter_mut().enumerate().take(dim) {
        *sum += T::read(v, i).to_f64();
    }
}

/// Accumulates a vector into a running f64 sum (k-means assignment pass).
pub fn sum_into(elem: ElementType, v: &[u8], sums: &mut [f64], dim: usize) {
    dispatch!(elem, sum_into_t(v, sums, dim))
}

fn mean_into_t<T: Scalar>(sums: &[f64], count: u32, out: &mut [u8], dim: usize) {
    for i in 0..dim {
        T::from_f64(sums[i] / count as f64).write(out, i);
    }
}

/// Divides sums by the cluster population and narrows back to the element
/// type (k-means update pass).
pub fn mean_into(elem: ElementType, sums: &[f64], count: u32, out: &mut [u8], dim: usize) {
    dispatch!(elem, mean_into_t(sums, count, out, dim))
}

fn residual_into_t<T: Scalar>(rec: &[u8], cent: &[u8], out: &mut [u8], dim: usize) {
    for i in 0..dim {
        T::from_f64(T::read(rec, i).to_f64() - T::read(cent, i).to_f64()).write(out, i);
    }
}

/// Element-wise `record - centroid`, staying in the element type.
pub fn residual_into(elem: ElementType, rec: &[u8], cent: &[u8], out: &mut [u8], dim: usize) {
    dispatch!(elem, residual_into_t(rec, cent, out, dim))
}

fn encode_t<T: Scalar>(values: &[f64], out: &mut [u8]) {
    for (i, &value) in values.iter().enumerate() {
        T::from_f64(value).write(out, i);
    }
}

/// Narrows parsed f64 values into packed element bytes. `out` must hold at
/// least `values.len()` elements; the value count must match `dim`.
pub fn encode_values(elem: ElementType, values: &[f64], dim: usize, out: &mut [u8]) -> Result<()> {
    if values.len() != dim {
        return Err(Error::Validation(format!(
            "vector has {} elements, dataset dimension is {dim}",
            values.len()
        )));
    }
    if out.len() < dim * elem.byte_size() {
        return Err(Error::Validation(format!(
            "output buffer of {} bytes cannot hold {dim} {} elements",
            out.len(),
            elem.name()
        )));
    }
    dispatch!(elem, encode_t(values, out));
    Ok(())
}

fn decode_t<T: Scalar>(bytes: &[u8], dim: usize) -> Vec<f64> {
    (0..dim).map(|i| T::read(bytes, i).to_f64()).collect()
}

/// Widens packed element bytes back to f64, for checks and tests.
pub fn decode_values(elem: ElementType, bytes: &[u8], dim: usize) -> Vec<f64> {
    dispatch!(elem, decode_t(bytes, dim))
}

fn format_t<T: Scalar>(bytes: &[u8], dim: usize, limit: usize) -> String {
    let mut parts = Vec::with_capacity(dim.min(limit));
    for i in 0..dim.min(limit) {
        parts.push(T::read(bytes, i).to_string());
    }
    parts.join(", ")
}

/// Renders up to `limit` leading coordinates in each element type's own
/// display form (so an f32 `5.1` prints as `5.1`, not its f64 widening).
pub fn format_vector(elem: ElementType, bytes: &[u8], dim: usize, limit: usize) -> String {
    dispatch!(elem, format_t(bytes, dim, limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn l1_l2_match_hand_computed_values() {
        let a = f32_bytes(&[1.0, 2.0, 3.0]);
        let b = f32_bytes(&[4.0, 6.0, 3.0]);

        assert_eq!(l1(ElementType::F32, &a, &b, 3), 7.0);
        assert_eq!(l2_sq(ElementType::F32, &a, &b, 3), 25.0);
        assert_eq!(l2(ElementType::F32, &a, &b, 3), 5.0);
    }

    #[test]
    fn cosine_of_parallel_and_orthogonal_vectors() {
        let a = f32_bytes(&[1.0, 0.0]);
        let b = f32_bytes(&[2.0, 0.0]);
        let c = f32_bytes(&[0.0, 3.0]);

        assert!((cosine(ElementType::F32, &a, &b, 2) - 1.0).abs() < 1e-12);
        assert!(cosine(ElementType::F32, &a, &c, 2).abs() < 1e-12);
    }

    #[test]
    fn f16_round_trips_through_encode_decode() {
        let values = [1.5f64, -2.25, 0.0, 100.0];
        let mut bytes = vec![0u8; 8];
        encode_values(ElementType::F16, &values, 4, &mut bytes).unwrap();
        assert_eq!(decode_values(ElementType::F16, &bytes, 4), values);
    }

    #[test]
    fn encode_rejects_dimension_mismatch() {
        let mut out = vec![0u8; 16];
        assert!(encode_values(ElementType::F32, &[1.0, 2.0], 3, &mut out).is_err());
        assert!(encode_values(ElementType::F32, &[1.0; 8], 8, &mut out).is_err());
    }

    #[test]
    fn sum_and_mean_recover_the_average() {
        let a = f32_bytes(&[1.0, 10.0]);
        let b = f32_bytes(&[3.0, 20.0]);
        let mut sums = vec![0.0; 2];
        sum_into(ElementType::F32, &a, &mut sums, 2);
        sum_into(ElementType::F32, &b, &mut sums, 2);

        let mut mean = vec![0u8; 8];
        mean_into(ElementType::F32, &sums, 2, &mut mean, 2);
        assert_eq!(decode_values(ElementType::F32, &mean, 2), vec![2.0, 15.0]);
    }

    #[test]
    fn residual_is_elementwise_difference() {
        let rec = f32_bytes(&[5.0, 7.0]);
        let cent = f32_bytes(&[1.5, 10.0]);
        let mut out = vec![0u8; 8];
        residual_into(ElementType::F32, &rec, &cent, &mut out, 2);
        assert_eq!(decode_values(ElementType::F32, &out, 2), vec![3.5, -3.0]);
    }

    #[test]
    fn format_vector_prints_native_element_repr() {
        let bytes = f32_bytes(&[5.1, 5.1, 5.1]);
        assert_eq!(format_vector(ElementType::F32, &bytes, 3, 3), "5.1, 5.1, 5.1");
        assert_eq!(format_vector(ElementType::F32, &bytes, 3, 2), "5.1, 5.1");
    }

    #[test]
    fn u8_kernels_widen_without_wrapping() {
        let a = vec![10u8, 200];
        let b = vec![250u8, 100];
        assert_eq!(l1(ElementType::U8, &a, &b, 2), 340.0);
        assert_eq!(l2_sq(ElementType::U8, &a, &b, 2), 240.0 * 240.0 + 100.0 * 100.0);
    }
}
