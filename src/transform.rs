use std::fmt::Write as _;
use thiserror::Error;

const ADJUSTMENT_MIN: i32 = -100;
const ADJUSTMENT_MAX: i32 = 100;

/// Crop strategy forwarded to the CDN. Only strategies the gallery actually
/// uses are whitelisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    Fill,
    Pad,
    Fit,
}

impl FitMode {
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fill" => Some(Self::Fill),
            "pad" => Some(Self::Pad),
            "fit" => Some(Self::Fit),
            _ => None,
        }
    }

    fn component(&self) -> &'static str {
        match self {
            Self::Fill => "c_fill",
            Self::Pad => "c_pad",
            Self::Fit => "c_fit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gravity {
    Auto,
    AutoSubject,
    Face,
    Center,
}

impl Gravity {
    pub fn from_param(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "auto:subject" => Some(Self::AutoSubject),
            "face" => Some(Self::Face),
            "center" => Some(Self::Center),
            _ => None,
        }
    }

    fn component(&self) -> &'static str {
        match self {
            Self::Auto => "g_auto",
            Self::AutoSubject => "g_auto:subject",
            Self::Face => "g_face",
            Self::Center => "g_center",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tint {
    pub amount: i32,
    pub color: String,
}

/// Whitelisted image adjustments translated into a delivery-URL descriptor.
/// Everything here is cosmetic; construction never performs I/O.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Option<FitMode>,
    pub gravity: Option<Gravity>,
    pub saturation: Option<i32>,
    pub hue: Option<i32>,
    pub brightness: Option<i32>,
    pub contrast: Option<i32>,
    pub tint: Option<Tint>,
    pub auto_quality: bool,
    pub auto_format: bool,
}

/// Raw query-string values before validation.
#[derive(Debug, Clone, Default)]
pub struct RawTransformParams {
    pub width: Option<String>,
    pub height: Option<String>,
    pub fit: Option<String>,
    pub gravity: Option<String>,
    pub saturation: Option<String>,
    pub hue: Option<String>,
    pub brightness: Option<String>,
    pub contrast: Option<String>,
    pub tint: Option<String>,
}

impl RawTransformParams {
    pub fn has_dimensions(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}

#[derive(Debug, Error)]
#[error("invalid transform parameters: {}", params.join(", "))]
pub struct InvalidTransformParams {
    pub params: Vec<String>,
}

impl TransformOptions {
    /// Validates raw parameters against the whitelist. Lenient mode drops
    /// anything unrecognized and clamps out-of-range adjustments; strict
    /// mode reports every offending parameter instead.
    pub fn from_raw(
        raw: &RawTransformParams,
        strict: bool,
    ) -> Result<Self, InvalidTransformParams> {
        let mut rejected = Vec::new();
        let mut options = Self::default();

        options.width = parse_dimension(raw.width.as_deref(), "w", &mut rejected);
        options.height = parse_dimension(raw.height.as_deref(), "h", &mut rejected);
        options.fit = parse_enum(raw.fit.as_deref(), "fit", FitMode::from_param, &mut rejected);
        options.gravity = parse_enum(
            raw.gravity.as_deref(),
            "g",
            Gravity::from_param,
            &mut rejected,
        );
        options.saturation =
            parse_adjustment(raw.saturation.as_deref(), "saturation", &mut rejected);
        options.hue = parse_adjustment(raw.hue.as_deref(), "hue", &mut rejected);
        options.brightness =
            parse_adjustment(raw.brightness.as_deref(), "brightness", &mut rejected);
        options.contrast = parse_adjustment(raw.contrast.as_deref(), "contrast", &mut rejected);
        options.tint = parse_tint(raw.tint.as_deref(), &mut rejected);

        if strict && !rejected.is_empty() {
            return Err(InvalidTransformParams { params: rejected });
        }
        Ok(options)
    }

    /// URL path descriptor for the options, empty when nothing applies.
    /// Sizing components share the first segment; each effect gets its own
    /// chained segment as the delivery API requires.
    pub fn descriptor(&self) -> String {
        let mut base = Vec::new();
        if let Some(width) = self.width {
            base.push(format!("w_{width}"));
        }
        if let Some(height) = self.height {
            base.push(format!("h_{height}"));
        }
        if let Some(fit) = self.fit {
            base.push(fit.component().to_string());
        }
        if let Some(gravity) = self.gravity {
            base.push(gravity.component().to_string());
        }
        if self.auto_quality {
            base.push("q_auto".to_string());
        }
        if self.auto_format {
            base.push("f_auto".to_string());
        }
        let mut segments = Vec::new();
        if !base.is_empty() {
            segments.push(base.join(","));
        }
        for (effect, value) in [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("hue", self.hue),
            ("saturation", self.saturation),
        ] {
            if let Some(value) = value {
                segments.push(format!("e_{effect}:{value}"));
            }
        }
        if let Some(tint) = &self.tint {
            segments.push(format!("e_tint:{}:{}", tint.amount, tint.color));
        }
        segments.join("/")
    }
}

/// Full delivery URL with the descriptor inserted right after the upload
/// marker. Spaces in public ids are the only characters the CDN stores that
/// need escaping here.
pub fn build_transform_url(
    cloud_name: &str,
    public_id: &str,
    options: &TransformOptions,
) -> String {
    let descriptor = options.descriptor();
    let mut url = format!("https://res.cloudinary.com/{cloud_name}/image/upload");
    if !descriptor.is_empty() {
        let _ = write!(url, "/{descriptor}");
    }
    let _ = write!(url, "/{}", public_id.replace(' ', "%20"));
    url
}

fn parse_dimension(value: Option<&str>, name: &str, rejected: &mut Vec<String>) -> Option<u32> {
    let value = value?.trim();
    match value.parse::<u32>() {
        Ok(parsed) if parsed > 0 => Some(parsed),
        _ => {
            rejected.push(format!("{name}={value}"));
            None
        }
    }
}

fn parse_enum<T>(
    value: Option<&str>,
    name: &str,
    parse: fn(&str) -> Option<T>,
    rejected: &mut Vec<String>,
) -> Option<T> {
    let value = value?;
    match parse(value) {
        Some(parsed) => Some(parsed),
        None => {
            rejected.push(format!("{name}={}", value.trim()));
            None
        }
    }
}

fn parse_adjustment(value: Option<&str>, name: &str, rejected: &mut Vec<String>) -> Option<i32> {
    let value = value?.trim();
    match value.parse::<i32>() {
        Ok(parsed) => Some(parsed.clamp(ADJUSTMENT_MIN, ADJUSTMENT_MAX)),
        Err(_) => {
            rejected.push(format!("{name}={value}"));
            None
        }
    }
}

/// Tint arrives as `amount:color`. The color token is forwarded into the
/// URL, so it is restricted to alphanumerics plus the `rgb:aabbcc` form.
fn parse_tint(value: Option<&str>, rejected: &mut Vec<String>) -> Option<Tint> {
    let value = value?.trim();
    let parsed = value.split_once(':').and_then(|(amount, color)| {
        let amount = amount.trim().parse::<i32>().ok()?;
        let color = color.trim();
        if color.is_empty() || !color.chars().all(is_color_char) {
            return None;
        }
        Some(Tint {
            amount: amount.clamp(0, ADJUSTMENT_MAX),
            color: color.to_ascii_lowercase(),
        })
    });
    if parsed.is_none() {
        rejected.push(format!("tint={value}"));
    }
    parsed
}

fn is_color_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == ':'
}
