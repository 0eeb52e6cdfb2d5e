use std::path::{Path, PathBuf};

use ffmpeg_next::ffi;
use thiserror::Error;

use crate::encoding::domain::encoder_format::{OutputFormat, VideoCodec};
use crate::muxing::domain::encoded_sample::EncodedSample;
use crate::muxing::domain::muxer::Muxer;
use crate::shared::constants::MICROS_PER_SECOND;
use crate::shared::error::BoxError;

/// Calls made out of order on a [`FfmpegMuxer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MuxerError {
    #[error("muxer is not open")]
    NotOpen,
    #[error("muxer is already open at {0}")]
    AlreadyOpen(PathBuf),
    #[error("a track is already registered")]
    TrackAlreadyAdded,
    #[error("no track registered")]
    NoTrack,
    #[error("muxer already started")]
    AlreadyStarted,
    #[error("muxer not started")]
    NotStarted,
    #[error("unknown track {0}")]
    UnknownTrack(usize),
    #[error("sample at {current}us precedes previous sample at {previous}us")]
    NonMonotonic { previous: i64, current: i64 },
    #[error("muxer already finalized")]
    Finalized,
}

const MICROS: ffmpeg_next::Rational = ffmpeg_next::Rational(1, MICROS_PER_SECOND as i32);

/// Writes one H.264 track into an MP4 container via ffmpeg-next.
///
/// Samples arrive already encoded with microsecond timestamps; they are
/// rescaled to whatever time base the container picks at header time.
pub struct FfmpegMuxer {
    path: Option<PathBuf>,
    octx: Option<ffmpeg_next::format::context::Output>,
    stream_index: Option<usize>,
    stream_time_base: ffmpeg_next::Rational,
    frame_duration_us: i64,
    started: bool,
    finalized: bool,
    last_pts_us: Option<i64>,
    last_dts: Option<i64>,
    samples_written: u64,
}

// Safety: FfmpegMuxer is owned by one thread at a time; the drain loop
// takes it over after start and hands it back for finalization.
unsafe impl Send for FfmpegMuxer {}

impl FfmpegMuxer {
    pub fn new() -> Self {
        Self {
            path: None,
            octx: None,
            stream_index: None,
            stream_time_base: MICROS,
            frame_duration_us: 0,
            started: false,
            finalized: false,
            last_pts_us: None,
            last_dts: None,
            samples_written: 0,
        }
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    fn octx_mut(&mut self) -> Result<&mut ffmpeg_next::format::context::Output, MuxerError> {
        if self.finalized {
            return Err(MuxerError::Finalized);
        }
        self.octx.as_mut().ok_or(MuxerError::NotOpen)
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for FfmpegMuxer {
    fn open(&mut self, path: &Path) -> Result<(), BoxError> {
        if self.finalized {
            return Err(MuxerError::Finalized.into());
        }
        if let Some(existing) = &self.path {
            return Err(MuxerError::AlreadyOpen(existing.clone()).into());
        }
        ffmpeg_next::init()?;

        let octx = ffmpeg_next::format::output_as(path, "mp4")?;
        log::debug!("Opened MP4 container at {}", path.display());

        self.path = Some(path.to_path_buf());
        self.octx = Some(octx);
        Ok(())
    }

    fn add_track(&mut self, format: &OutputFormat) -> Result<usize, BoxError> {
        if self.started {
            return Err(MuxerError::AlreadyStarted.into());
        }
        if self.stream_index.is_some() {
            return Err(MuxerError::TrackAlreadyAdded.into());
        }
        let octx = self.octx_mut()?;

        let mut ost = octx.add_stream(ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::None))?;
        set_video_parameters(&ost.parameters(), format);
        unsafe {
            (*ost.parameters().as_mut_ptr()).codec_tag = 0;
        }
        ost.set_time_base(MICROS);
        if format.frame_rate > 0 {
            ost.set_avg_frame_rate(ffmpeg_next::Rational(format.frame_rate as i32, 1));
        }
        let index = ost.index();

        self.stream_index = Some(index);
        self.frame_duration_us = MICROS_PER_SECOND / format.frame_rate.max(1) as i64;
        Ok(index)
    }

    fn start(&mut self) -> Result<(), BoxError> {
        if self.started {
            return Err(MuxerError::AlreadyStarted.into());
        }
        let index = self.stream_index.ok_or(MuxerError::NoTrack)?;
        let octx = self.octx_mut()?;

        octx.write_header()?;
        let time_base = octx
            .stream(index)
            .ok_or(MuxerError::UnknownTrack(index))?
            .time_base();

        self.stream_time_base = time_base;
        self.started = true;
        log::debug!("MP4 header written, stream time base {time_base}");
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, sample: &EncodedSample) -> Result<(), BoxError> {
        if !self.started {
            return Err(MuxerError::NotStarted.into());
        }
        if self.stream_index != Some(track_index) {
            return Err(MuxerError::UnknownTrack(track_index).into());
        }
        if let Some(previous) = self.last_pts_us {
            if sample.presentation_time_us < previous {
                return Err(MuxerError::NonMonotonic {
                    previous,
                    current: sample.presentation_time_us,
                }
                .into());
            }
        }

        let mut packet = ffmpeg_next::Packet::copy(&sample.payload);
        packet.set_stream(track_index);
        packet.set_pts(Some(sample.presentation_time_us));
        packet.set_dts(Some(sample.presentation_time_us));
        packet.set_duration(self.frame_duration_us);
        packet.set_position(-1);
        if sample.is_key_frame {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        packet.rescale_ts(MICROS, self.stream_time_base);

        // MP4 needs strictly increasing dts; equal timestamps can collapse
        // after rescaling to a coarser time base.
        if let (Some(last), Some(dts)) = (self.last_dts, packet.dts()) {
            if dts <= last {
                packet.set_dts(Some(last + 1));
                packet.set_pts(Some(last + 1));
            }
        }
        let dts = packet.dts();

        let octx = self.octx_mut()?;
        packet.write_interleaved(octx)?;

        self.last_pts_us = Some(sample.presentation_time_us);
        self.last_dts = dts;
        self.samples_written += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), BoxError> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        let Some(mut octx) = self.octx.take() else {
            return Ok(());
        };

        if self.started {
            octx.write_trailer()?;
            log::debug!(
                "Finalized {} with {} samples",
                self.path.as_deref().unwrap_or(Path::new("")).display(),
                self.samples_written
            );
        } else {
            log::warn!("Closing MP4 container that never received a track");
        }
        Ok(())
    }
}

fn set_video_parameters(params: &ffmpeg_next::codec::Parameters, format: &OutputFormat) {
    unsafe {
        let ptr = params.as_ptr() as *mut ffi::AVCodecParameters;

        (*ptr).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
        (*ptr).codec_id = match format.codec {
            VideoCodec::H264 => ffi::AVCodecID::AV_CODEC_ID_H264,
        };
        (*ptr).width = format.width as i32;
        (*ptr).height = format.height as i32;
        (*ptr).format = ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as i32;
        (*ptr).bit_rate = format.bit_rate as i64;

        // SPS/PPS must be padded the way libavformat expects.
        if !format.extradata.is_empty() {
            let len = format.extradata.len();
            let buf = ffi::av_mallocz(len + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
            if !buf.is_null() {
                std::ptr::copy_nonoverlapping(format.extradata.as_ptr(), buf, len);
                (*ptr).extradata = buf;
                (*ptr).extradata_size = len as i32;
            }
        }
    }
}
