//! Encoder configuration: everything needed to build the encoder's argument
//! vector and to pick the right InitCache container parser.
//!
//! Grounded on the teacher's `ServerConfig` (serde-derived, YAML-loadable
//! struct with `Default` for every field that has a sane default).

use serde::{Deserialize, Serialize};

use crate::init_cache::ContainerKind;

/// Codec family produced by the encoder. Determines both the default
/// container kind and the `codec` field sent in `hello`/bound into AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// H.264, carried in a fragmented MP4 (box container).
    H264,
    /// VP8, carried in a WebM/Matroska stream (cluster container).
    Vp8,
    /// VP9, carried in a WebM/Matroska stream (cluster container).
    Vp9,
}

impl Codec {
    /// The lowercase wire name sent in `hello.codec`.
    #[must_use]
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
        }
    }

    /// The container family this codec is carried in, and thus which
    /// InitCache parser applies.
    #[must_use]
    pub fn container_kind(&self) -> ContainerKind {
        match self {
            Self::H264 => ContainerKind::Box,
            Self::Vp8 | Self::Vp9 => ContainerKind::Cluster,
        }
    }
}

/// Full configuration for one encoder run. An immutable snapshot per
/// supervisor run; a new one is built on every restart from the live
/// `ServerConfig`, so config edits are picked up only across a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to the encoder binary (e.g. an ffmpeg-compatible executable).
    #[serde(default = "default_encoder_binary")]
    pub encoder_binary: String,
    /// Camera device identifier, also the key used for device-lock
    /// arbitration.
    pub device_id: String,
    /// Codec family the encoder is configured to produce.
    pub codec: Codec,
    /// Output frame width in pixels.
    pub width: u32,
    /// Output frame height in pixels.
    pub height: u32,
    /// Target frames per second.
    pub fps: u32,
    /// Additional encoder tuning flags, appended verbatim to the argument
    /// vector after the required positional arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl EncoderConfig {
    /// Builds the argument vector to spawn the encoder with. The exact
    /// flags are binary-specific; this assembles an ffmpeg-shaped
    /// invocation that captures `device_id`, encodes to `codec` at
    /// `width x height @ fps`, and writes the container to stdout.
    #[must_use]
    pub fn build_argv(&self) -> Vec<String> {
        let mut argv = vec![
            self.encoder_binary.clone(),
            "-f".to_string(),
            "v4l2".to_string(),
            "-i".to_string(),
            self.device_id.clone(),
            "-s".to_string(),
            format!("{}x{}", self.width, self.height),
            "-r".to_string(),
            self.fps.to_string(),
            "-c:v".to_string(),
            ffmpeg_codec_name(self.codec).to_string(),
        ];
        argv.extend(self.extra_args.iter().cloned());
        argv.push("-f".to_string());
        argv.push(ffmpeg_container_name(self.codec).to_string());
        argv.push("pipe:1".to_string());
        argv
    }
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn ffmpeg_codec_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "libx264",
        Codec::Vp8 => "libvpx",
        Codec::Vp9 => "libvpx-vp9",
    }
}

fn ffmpeg_container_name(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "mp4",
        Codec::Vp8 | Codec::Vp9 => "webm",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(codec: Codec) -> EncoderConfig {
        EncoderConfig {
            encoder_binary: "ffmpeg".to_string(),
            device_id: "/dev/video0".to_string(),
            codec,
            width: 1920,
            height: 1080,
            fps: 30,
            extra_args: vec![],
        }
    }

    #[test]
    fn h264_selects_box_container() {
        assert_eq!(sample(Codec::H264).codec.container_kind(), ContainerKind::Box);
    }

    #[test]
    fn vp9_selects_cluster_container() {
        assert_eq!(sample(Codec::Vp9).codec.container_kind(), ContainerKind::Cluster);
    }

    #[test]
    fn argv_includes_device_and_resolution() {
        let argv = sample(Codec::H264).build_argv();
        assert!(argv.contains(&"/dev/video0".to_string()));
        assert!(argv.contains(&"1920x1080".to_string()));
        assert!(argv.contains(&"pipe:1".to_string()));
    }

    #[test]
    fn extra_args_are_appended_before_output_flags() {
        let mut config = sample(Codec::Vp8);
        config.extra_args = vec!["-tune".to_string(), "zerolatency".to_string()];
        let argv = config.build_argv();
        let tune_pos = argv.iter().position(|a| a == "-tune").unwrap();
        let output_pos = argv.iter().position(|a| a == "pipe:1").unwrap();
        assert!(tune_pos < output_pos);
    }
}
