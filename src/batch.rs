use std::sync::Arc;

use bevy::prelude::*;
use half::f16;
use rand::Rng;

use crate::log::{LogKind, OnceLog, SplatAttribute};


/// Spherical harmonic coefficients per color channel, degrees 1 through 3.
pub const SH_COEFF_COUNT: usize = 15;
pub const SH_MAX_DEGREE: u32 = 3;

pub type ShCoefficients = [f16; SH_COEFF_COUNT];


#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("attribute `{attribute}` has {actual} elements, expected {expected}")]
    LengthMismatch {
        attribute: &'static str,
        expected: usize,
        actual: usize,
    },
}


/// Per-channel spherical harmonic coefficients. The three channels are either
/// all present or the batch carries none.
#[derive(Clone, Debug)]
pub struct ShChannels {
    pub x: Arc<[ShCoefficients]>,
    pub y: Arc<[ShCoefficients]>,
    pub z: Arc<[ShCoefficients]>,
}

impl ShChannels {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Coefficient `index` of splat `splat` as an rgb triple.
    pub fn coefficient(&self, splat: usize, index: usize) -> [f16; 3] {
        [
            self.x[splat][index],
            self.y[splat][index],
            self.z[splat][index],
        ]
    }
}


/// One owner's splat attributes. Buffers are reference counted so the
/// registry can hold them past the adapter's update call without copying.
#[derive(Clone, Debug)]
pub struct SplatBatch {
    positions: Arc<[Vec3]>,
    colors: Arc<[[f16; 3]]>,
    alphas: Arc<[f32]>,
    scales: Arc<[[f16; 3]]>,
    /// quaternions in w, x, y, z order
    orientations: Arc<[[f16; 4]]>,
    sh: Option<ShChannels>,
}

impl SplatBatch {
    pub fn new(
        positions: impl Into<Arc<[Vec3]>>,
        colors: impl Into<Arc<[[f16; 3]]>>,
        alphas: impl Into<Arc<[f32]>>,
        scales: impl Into<Arc<[[f16; 3]]>>,
        orientations: impl Into<Arc<[[f16; 4]]>>,
        sh: Option<ShChannels>,
    ) -> Result<Self, BatchError> {
        let batch = Self {
            positions: positions.into(),
            colors: colors.into(),
            alphas: alphas.into(),
            scales: scales.into(),
            orientations: orientations.into(),
            sh: sh.filter(|sh| !sh.is_empty()),
        };

        let expected = batch.positions.len();
        let mut lengths = vec![
            ("colors", batch.colors.len()),
            ("alphas", batch.alphas.len()),
            ("scales", batch.scales.len()),
            ("orientations", batch.orientations.len()),
        ];
        if let Some(sh) = &batch.sh {
            lengths.extend([
                ("sh_x", sh.x.len()),
                ("sh_y", sh.y.len()),
                ("sh_z", sh.z.len()),
            ]);
        }

        for (attribute, actual) in lengths {
            if actual != expected {
                return Err(BatchError::LengthMismatch {
                    attribute,
                    expected,
                    actual,
                });
            }
        }

        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn colors(&self) -> &[[f16; 3]] {
        &self.colors
    }

    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    pub fn scales(&self) -> &[[f16; 3]] {
        &self.scales
    }

    pub fn orientations(&self) -> &[[f16; 4]] {
        &self.orientations
    }

    pub fn sh(&self) -> Option<&ShChannels> {
        self.sh.as_ref()
    }

    pub fn has_sh(&self) -> bool {
        self.sh.is_some()
    }
}


/// Named point attributes as read from a scene object. Anything missing is
/// replaced by a neutral default when converted into a [`SplatBatch`].
#[derive(Clone, Debug, Default)]
pub struct SplatAttributes {
    pub positions: Vec<Vec3>,
    pub colors: Option<Vec<Vec3>>,
    pub opacities: Option<Vec<f32>>,
    pub scales: Option<Vec<Vec3>>,
    pub orientations: Option<Vec<Quat>>,
    pub spherical_harmonics: Option<Vec<[Vec3; SH_COEFF_COUNT]>>,
}

impl SplatAttributes {
    pub fn into_batch(self, log: &mut OnceLog) -> Result<SplatBatch, BatchError> {
        let count = self.positions.len();

        let colors = resolve(self.colors, SplatAttribute::Color, log)
            .map(|colors| colors.iter().map(|c| half3(*c)).collect::<Vec<_>>())
            .unwrap_or_else(|| vec![half3(Vec3::ONE); count]);

        let alphas = resolve(self.opacities, SplatAttribute::Opacity, log)
            .unwrap_or_else(|| vec![1.0; count]);

        let scales = resolve(self.scales, SplatAttribute::Scale, log)
            .map(|scales| scales.iter().map(|s| half3(*s)).collect::<Vec<_>>())
            .unwrap_or_else(|| vec![half3(Vec3::ONE); count]);

        let orientations = resolve(self.orientations, SplatAttribute::Orientation, log)
            .map(|orientations| orientations.iter().map(|q| half_wxyz(*q)).collect::<Vec<_>>())
            .unwrap_or_else(|| vec![half_wxyz(Quat::IDENTITY); count]);

        // spherical harmonics are optional, absence is not worth a warning
        let sh = self.spherical_harmonics.map(|coefficients| {
            let channel = |axis: usize| -> Arc<[ShCoefficients]> {
                coefficients
                    .iter()
                    .map(|splat| std::array::from_fn(|j| f16::from_f32(splat[j][axis])))
                    .collect()
            };

            ShChannels {
                x: channel(0),
                y: channel(1),
                z: channel(2),
            }
        });

        SplatBatch::new(self.positions, colors, alphas, scales, orientations, sh)
    }
}

fn resolve<T>(attribute: Option<T>, kind: SplatAttribute, log: &mut OnceLog) -> Option<T> {
    let kind_key = LogKind::MissingAttribute(kind);
    match attribute {
        Some(values) => {
            log.clear(kind_key);
            Some(values)
        }
        None => {
            log.warn(
                kind_key,
                &format!("attribute `{}` not found, using default", kind.name()),
            );
            None
        }
    }
}

pub fn half3(v: Vec3) -> [f16; 3] {
    [
        f16::from_f32(v.x),
        f16::from_f32(v.y),
        f16::from_f32(v.z),
    ]
}

pub fn half_wxyz(q: Quat) -> [f16; 4] {
    [
        f16::from_f32(q.w),
        f16::from_f32(q.x),
        f16::from_f32(q.y),
        f16::from_f32(q.z),
    ]
}


pub fn random_batch(n: usize, with_sh: bool) -> SplatBatch {
    let mut rng = rand::thread_rng();

    let mut attributes = SplatAttributes {
        positions: Vec::with_capacity(n),
        colors: Some(Vec::with_capacity(n)),
        opacities: Some(Vec::with_capacity(n)),
        scales: Some(Vec::with_capacity(n)),
        orientations: Some(Vec::with_capacity(n)),
        spherical_harmonics: with_sh.then(|| Vec::with_capacity(n)),
    };

    for _ in 0..n {
        let mut sample = |range: std::ops::Range<f32>| {
            Vec3::new(
                rng.gen_range(range.clone()),
                rng.gen_range(range.clone()),
                rng.gen_range(range),
            )
        };

        attributes.positions.push(sample(-20.0..20.0));
        if let Some(colors) = attributes.colors.as_mut() {
            colors.push(sample(0.0..1.0));
        }
        if let Some(scales) = attributes.scales.as_mut() {
            scales.push(sample(0.01..0.5));
        }
        if let Some(sh) = attributes.spherical_harmonics.as_mut() {
            sh.push(std::array::from_fn(|_| sample(-1.0..1.0)));
        }
        if let Some(opacities) = attributes.opacities.as_mut() {
            opacities.push(rng.gen_range(0.0..0.8));
        }
        if let Some(orientations) = attributes.orientations.as_mut() {
            let axis = Vec3::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            )
            .try_normalize()
            .unwrap_or(Vec3::Y);
            orientations.push(Quat::from_axis_angle(axis, rng.gen_range(0.0..std::f32::consts::TAU)));
        }
    }

    attributes
        .into_batch(&mut OnceLog::default())
        .expect("random attributes share one length")
}
