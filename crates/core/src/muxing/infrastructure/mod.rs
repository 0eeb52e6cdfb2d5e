pub mod ffmpeg_muxer;
