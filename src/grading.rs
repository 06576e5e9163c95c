use serde::Serialize;

/// Half-up rounding to the nearest integer: `Int(x + 0.5)`.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Cut-points for the false-positive grade bands of one clean sample set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBands {
    pub ap: i64,
    pub a: i64,
    pub b: i64,
    pub c: i64,
    pub d: i64,
}

impl GradeBands {
    pub fn as_tuple(&self) -> (i64, i64, i64, i64, i64) {
        (self.ap, self.a, self.b, self.c, self.d)
    }

    pub fn is_ordered(&self) -> bool {
        self.ap <= self.a && self.a <= self.b && self.b <= self.c && self.c <= self.d
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn label(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

/// Computes the band cut-points for a clean sample of `clean_sample_size` files.
///
/// Small sizes may round into non-monotonic bands; that is left as-is since the
/// bands are only used for display.
pub fn grade_bands(clean_sample_size: u64) -> GradeBands {
    let t = clean_sample_size as f64;
    let cut = |kept: f64| round_half_up(t - t * kept);
    GradeBands {
        ap: cut(0.995),
        a: cut(0.97),
        b: cut(0.90),
        c: cut(0.85),
        d: cut(0.75),
    }
}

/// Labels a false-positive or miss count against `bands`.
pub fn grade_for(count: i64, bands: &GradeBands) -> Grade {
    if count <= bands.ap {
        Grade::APlus
    } else if count <= bands.a {
        Grade::A
    } else if count <= bands.b {
        Grade::B
    } else if count <= bands.c {
        Grade::C
    } else if count <= bands.d {
        Grade::D
    } else {
        Grade::F
    }
}
