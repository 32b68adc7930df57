//! ffmpeg argument builders
//!
//! Every builder is a pure function of resolved policy values and paths. User
//! extra parameters always land after the template's own arguments and before
//! the output, so they can override template choices.

use super::args::EncoderArgs;
use crate::policy::{format_time_from_seconds, AudioTemplate, GradientParams, VideoQuality};
use std::path::{Path, PathBuf};

/// Length of the window sampled for GIF palette generation
pub const PALETTE_SAMPLE_SECS: u32 = 5;

fn push_audio_template(args: &mut EncoderArgs, template: &AudioTemplate, extra: &[String]) {
    args.arg("-c:a").arg(template.codec);
    args.arg("-ar").arg(&template.sample_rate);
    if let Some(fmt) = template.sample_fmt {
        args.arg("-sample_fmt").arg(fmt);
    }
    if let Some(filter) = &template.filter {
        args.arg("-filter_complex").arg(filter);
    }
    args.args(template.container_flags());
    args.args(extra);
    args.arg("-f").arg(template.container.extension());
}

/// Audio transcode streamed to stdout
pub fn audio_stream_args(src: &Path, template: &AudioTemplate, extra: &[String]) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-i").arg(src);
    push_audio_template(&mut args, template, extra);
    args.arg("pipe:1");
    args
}

/// Audio transcode written to a cache temp file
pub fn audio_cache_args(
    src: &Path,
    temp: &Path,
    template: &AudioTemplate,
    extra: &[String],
) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-i").arg(src);
    push_audio_template(&mut args, template, extra);
    args.arg(temp);
    args
}

/// Fragmented MP4 (H.264/AAC) streamed to stdout
pub fn video_stream_args(
    src: &Path,
    quality: &VideoQuality,
    hwaccel: bool,
    extra: &[String],
) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    if hwaccel {
        args.args(["-hwaccel", "auto"]);
    }
    args.arg("-i").arg(src);
    args.args([
        "-f",
        "mp4",
        "-movflags",
        "frag_keyframe+empty_moov+faststart",
        "-vcodec",
        "libx264",
        "-pix_fmt",
        "yuv420p",
        "-acodec",
        "aac",
        "-strict",
        "-2",
    ]);
    args.arg("-crf").arg(quality.triple.crf.to_string());
    args.arg("-preset").arg(&quality.triple.preset);
    args.arg("-tune").arg(&quality.triple.tune);
    if let Some(threads) = quality.threads {
        args.arg("-threads").arg(threads.to_string());
    }
    args.args([
        "-frag_duration",
        "10000",
        "-frag_size",
        "256",
        "-min_frag_duration",
        "5000",
        "-movflags",
        "frag_custom",
        "-flush_packets",
        "1",
        "-max_muxing_queue_size",
        "256",
    ]);
    args.args(extra);
    args.arg("pipe:1");
    args
}

/// Intermediate palette path next to a GIF target (`name.gif` -> `name_palette.png`)
pub fn palette_path(gif: &Path) -> PathBuf {
    let stem = gif
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    gif.with_file_name(format!("{}_palette.png", stem))
}

fn scale_filter(params: &GradientParams) -> String {
    format!("fps={},scale={}:-1:flags=lanczos", params.fps, params.width)
}

/// Palette stage: sample a short window at the tier's start offset
pub fn palette_args(src: &Path, palette: &Path, params: &GradientParams) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-ss").arg(format_time_from_seconds(params.start_secs));
    args.arg("-t").arg(PALETTE_SAMPLE_SECS.to_string());
    args.arg("-i").arg(src);
    args.arg("-vf").arg(format!("{},palettegen", scale_filter(params)));
    args.arg("-y").arg(palette);
    args
}

/// Paletted encode stage producing the animated preview
pub fn gif_args(src: &Path, palette: &Path, out: &Path, params: &GradientParams) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-ss").arg(format_time_from_seconds(params.start_secs));
    args.arg("-t").arg(params.duration.to_string());
    args.arg("-i").arg(src);
    args.arg("-i").arg(palette);
    args.arg("-filter_complex").arg(format!(
        "{}[x];[x][1:v]paletteuse=dither=bayer:bayer_scale=3",
        scale_filter(params)
    ));
    args.args(["-loop", "0", "-f", "gif", "-y"]);
    args.arg(out);
    args
}

/// Single-frame JPG at a fixed timestamp
pub fn jpg_thumbnail_args(src: &Path, out: &Path, timestamp: &str) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-ss").arg(timestamp);
    args.arg("-i").arg(src);
    args.args(["-vframes", "1", "-q:v", "2", "-f", "image2"]);
    args.arg(out);
    args
}

/// Copy the embedded cover art stream out of an audio file
pub fn cover_args(src: &Path, out: &Path) -> EncoderArgs {
    let mut args = EncoderArgs::new();
    args.arg("-i").arg(src);
    args.args(["-an", "-vcodec", "copy"]);
    args.arg(out);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::{
        audio_template, gradient_params, video_quality, DsdMode, GradientTier, OutputContainer,
        SourceClass,
    };

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn position(args: &[String], value: &str) -> usize {
        args.iter()
            .position(|a| a == value)
            .unwrap_or_else(|| panic!("{} missing from {:?}", value, args))
    }

    #[test]
    fn test_dsd_wav_stream_args() {
        let template = AudioTemplate::resolve(OutputContainer::Wav, SourceClass::Dsd, DsdMode::High);
        let args = audio_stream_args(Path::new("/m/a.dsf"), &template, &[]).to_strings();

        assert_eq!(&args[..2], &["-i", "/m/a.dsf"]);
        assert!(has_flag_with_value(&args, "-c:a", "pcm_s24le"));
        assert!(has_flag_with_value(&args, "-ar", "88200"));
        assert!(has_flag_with_value(&args, "-sample_fmt", "s32"));
        assert!(has_flag_with_value(
            &args,
            "-filter_complex",
            "aresample=resampler=soxr:precision=28:osr=88200"
        ));
        assert!(has_flag_with_value(&args, "-fflags", "+bitexact"));
        assert!(has_flag_with_value(&args, "-write_xing", "0"));
        assert_eq!(&args[args.len() - 3..], &["-f", "wav", "pipe:1"]);
    }

    #[test]
    fn test_flac_cache_args_write_to_temp() {
        let cfg = Config {
            audio: crate::config::AudioConfig {
                format: "flac".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let template = audio_template(&cfg, "ape");
        let args = audio_cache_args(
            Path::new("/m/a.ape"),
            Path::new("/m/cache/tmp_a.flac"),
            &template,
            &[],
        )
        .to_strings();

        assert!(has_flag_with_value(&args, "-c:a", "flac"));
        assert!(has_flag_with_value(&args, "-ar", "48000"));
        assert!(has_flag_with_value(&args, "-compression_level", "5"));
        assert!(has_flag_with_value(&args, "-lpc_type", "cholesky"));
        assert!(!args.iter().any(|a| a == "-sample_fmt"));
        assert_eq!(&args[args.len() - 3..], &["-f", "flac", "/m/cache/tmp_a.flac"]);
    }

    #[test]
    fn test_extra_params_follow_template_and_precede_output() {
        let template =
            AudioTemplate::resolve(OutputContainer::Wav, SourceClass::Other, DsdMode::High);
        let extra = vec!["-ar".to_string(), "96000".to_string()];
        let args = audio_stream_args(Path::new("a.ogg"), &template, &extra).to_strings();

        let template_rate = position(&args, "48000");
        let user_rate = position(&args, "96000");
        assert!(template_rate < user_rate);
        assert!(user_rate < position(&args, "pipe:1"));
    }

    #[test]
    fn test_video_stream_args() {
        let cfg = Config::default();
        let quality = video_quality(&cfg, None);
        let args = video_stream_args(Path::new("/v/clip.wmv"), &quality, true, &[]).to_strings();

        assert_eq!(&args[..4], &["-hwaccel", "auto", "-i", "/v/clip.wmv"]);
        assert!(has_flag_with_value(&args, "-f", "mp4"));
        assert!(has_flag_with_value(&args, "-vcodec", "libx264"));
        assert!(has_flag_with_value(&args, "-crf", "23"));
        assert!(has_flag_with_value(&args, "-preset", "fast"));
        assert!(has_flag_with_value(&args, "-tune", "film"));
        assert!(has_flag_with_value(&args, "-movflags", "frag_custom"));
        assert!(!args.iter().any(|a| a == "-threads"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_fast_video_caps_threads() {
        let mut cfg = Config::default();
        cfg.transcode.quality = "fast".to_string();
        let quality = video_quality(&cfg, Some(10));
        let args = video_stream_args(Path::new("v.avi"), &quality, false, &[]).to_strings();
        assert_eq!(&args[..2], &["-i", "v.avi"]);
        assert!(has_flag_with_value(&args, "-threads", "2"));
        assert!(has_flag_with_value(&args, "-crf", "28"));
    }

    #[test]
    fn test_gif_pipeline_args() {
        let cfg = Config::default();
        let params = gradient_params(&cfg, GradientTier::Long);
        let out = Path::new("/v/cache/videothumbnail/clip.gif");
        let palette = palette_path(out);
        assert_eq!(palette, Path::new("/v/cache/videothumbnail/clip_palette.png"));

        let stage1 = palette_args(Path::new("/v/clip.mkv"), &palette, &params).to_strings();
        assert!(has_flag_with_value(&stage1, "-ss", "00:10:00"));
        assert!(has_flag_with_value(&stage1, "-t", "5"));
        assert!(has_flag_with_value(
            &stage1,
            "-vf",
            "fps=6,scale=320:-1:flags=lanczos,palettegen"
        ));

        let stage2 = gif_args(Path::new("/v/clip.mkv"), &palette, out, &params).to_strings();
        assert!(has_flag_with_value(&stage2, "-t", "12"));
        assert!(has_flag_with_value(
            &stage2,
            "-filter_complex",
            "fps=6,scale=320:-1:flags=lanczos[x];[x][1:v]paletteuse=dither=bayer:bayer_scale=3"
        ));
        assert!(has_flag_with_value(&stage2, "-loop", "0"));
        assert_eq!(stage2.last().map(String::as_str), out.to_str());
    }

    #[test]
    fn test_jpg_and_cover_args() {
        let jpg = jpg_thumbnail_args(Path::new("v.mp4"), Path::new("v.jpg"), "00:00:05").to_strings();
        assert_eq!(
            jpg,
            vec!["-ss", "00:00:05", "-i", "v.mp4", "-vframes", "1", "-q:v", "2", "-f", "image2", "v.jpg"]
        );

        let cover = cover_args(Path::new("a.flac"), Path::new("a.jpg")).to_strings();
        assert_eq!(cover, vec!["-i", "a.flac", "-an", "-vcodec", "copy", "a.jpg"]);
    }
}
