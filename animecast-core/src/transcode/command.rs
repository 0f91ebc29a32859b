use std::path::Path;

use crate::config::EncoderSection;
use crate::rendition::QualityPreset;

/// `{language-}{label}.mp4`; an empty language drops the prefix.
pub fn rendition_file_name(language: &str, label: &str) -> String {
    let language = language.trim();
    if language.is_empty() {
        format!("{label}.mp4")
    } else {
        format!("{language}-{label}.mp4")
    }
}

pub fn output_directory(anime_id: i64, season_number: u32, episode_number: u32) -> String {
    format!("videos/anime/{anime_id}/s{season_number}/e{episode_number}")
}

#[derive(Debug, Clone)]
pub struct EncoderCommand<'a> {
    pub ffmpeg: &'a str,
    pub encoder: &'a EncoderSection,
    pub preset: &'a QualityPreset,
    pub source: &'a Path,
    pub output: &'a Path,
    pub overwrite: bool,
}

impl EncoderCommand<'_> {
    /// Full argv, program first. Progress goes to stdout as `key=value` lines.
    pub fn argv(&self) -> Vec<String> {
        let preset = self.preset;
        let encoder = self.encoder;
        let scale = format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease",
            preset.width, preset.height
        );
        let mut argv: Vec<String> = vec![
            self.ffmpeg.to_string(),
            if self.overwrite { "-y" } else { "-n" }.to_string(),
            "-i".into(),
            self.source.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-vf".into(),
            scale,
            "-c:v".into(),
            encoder.video_codec.clone(),
            "-pix_fmt".into(),
            encoder.pixel_format.clone(),
            "-preset".into(),
            encoder.preset.clone(),
            "-crf".into(),
            preset.crf.to_string(),
            "-c:a".into(),
            encoder.audio_codec.clone(),
            "-b:a".into(),
            encoder.audio_bitrate.clone(),
            "-ac".into(),
            encoder.audio_channels.to_string(),
            "-ar".into(),
            encoder.audio_sample_rate.to_string(),
        ];
        if encoder.faststart {
            argv.push("-movflags".into());
            argv.push("+faststart".into());
        }
        argv.extend(["-progress", "pipe:1", "-nostats"].map(String::from));
        argv.push(self.output.to_string_lossy().to_string());
        argv
    }
}
