//! Source Reader over `android.media.MediaExtractor`.

use std::time::Duration;

use jni::objects::{GlobalRef, JObject, JString, JValue};
use jni::JNIEnv;

use vidsurface_core::source::resolve_video_track;
use vidsurface_core::video::{BufferFlags, MediaFormat, Rotation, TrackInfo, VideoError};
use vidsurface_core::SourceReader;

use crate::jvm::{self, JniFailure};

/// Locators opened through a `Context` rather than as a plain path or URL.
const URI_SCHEMES: &[&str] = &["content://", "file://", "android.resource://"];

/// `MediaExtractor.SAMPLE_FLAG_SYNC`
const SAMPLE_FLAG_SYNC: i32 = 1;

pub struct AndroidSource {
    extractor: GlobalRef,
    track: TrackInfo,
    sample_time_us: i64,
    sample_flags: BufferFlags,
    released: bool,
}

impl AndroidSource {
    /// Opens `locator` and selects its first video track.
    ///
    /// `context` is required for `content://`, `file://` and
    /// `android.resource://` URIs.
    pub fn open(context: Option<&GlobalRef>, locator: &str) -> Result<Self, VideoError> {
        let (extractor, formats) =
            jvm::call("MediaExtractor.setDataSource", VideoError::SourceUnreadable, |env| {
                let extractor = env.new_object("android/media/MediaExtractor", "()V", &[])?;
                if let Err(e) = set_data_source(env, &extractor, context, locator) {
                    let reason = jvm::take_exception(env).unwrap_or(e.0);
                    env.call_method(&extractor, "release", "()V", &[])?;
                    return Err(JniFailure(reason));
                }
                let count = env
                    .call_method(&extractor, "getTrackCount", "()I", &[])?
                    .i()?;
                let mut formats = Vec::with_capacity(count.max(0) as usize);
                for i in 0..count {
                    let format = env
                        .call_method(
                            &extractor,
                            "getTrackFormat",
                            "(I)Landroid/media/MediaFormat;",
                            &[JValue::Int(i)],
                        )?
                        .l()?;
                    formats.push(read_track_format(env, &format)?);
                    env.delete_local_ref(format)?;
                }
                Ok((env.new_global_ref(&extractor)?, formats))
            })?;

        let track = match resolve_video_track(locator, &formats) {
            Ok(track) => track,
            Err(e) => {
                release_extractor(&extractor);
                return Err(e);
            }
        };

        let selected = jvm::call("MediaExtractor.selectTrack", VideoError::SourceUnreadable, |env| {
            env.call_method(
                &extractor,
                "selectTrack",
                "(I)V",
                &[JValue::Int(track.track_index as i32)],
            )?;
            Ok(())
        });
        if let Err(e) = selected {
            release_extractor(&extractor);
            return Err(e);
        }

        tracing::info!(
            "AndroidSource: {} track {} ({} {}x{})",
            locator,
            track.track_index,
            track.format.mime,
            track.format.width,
            track.format.height
        );
        let mut source = Self {
            extractor,
            track,
            sample_time_us: 0,
            sample_flags: BufferFlags::NONE,
            released: false,
        };
        source.refresh_sample_info();
        Ok(source)
    }

    fn refresh_sample_info(&mut self) {
        let extractor = &self.extractor;
        let info = jvm::call("MediaExtractor.getSampleTime", VideoError::SourceUnreadable, |env| {
            let time = env.call_method(extractor, "getSampleTime", "()J", &[])?.j()?;
            let flags = env.call_method(extractor, "getSampleFlags", "()I", &[])?.i()?;
            Ok((time, flags))
        });
        match info {
            Ok((time, flags)) => {
                self.sample_time_us = time.max(0);
                self.sample_flags = if flags & SAMPLE_FLAG_SYNC != 0 {
                    BufferFlags::KEY_FRAME
                } else {
                    BufferFlags::NONE
                };
            }
            Err(e) => tracing::warn!("AndroidSource: {e}"),
        }
    }
}

impl SourceReader for AndroidSource {
    fn track_info(&self) -> &TrackInfo {
        &self.track
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, VideoError> {
        if self.released {
            return Err(VideoError::IllegalState("source already released".into()));
        }
        let extractor = &self.extractor;
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        let size = jvm::call("MediaExtractor.readSampleData", VideoError::SourceUnreadable, |env| {
            // The direct buffer aliases `buf`, which outlives this call.
            let buffer = unsafe { env.new_direct_byte_buffer(ptr, len)? };
            let size = env
                .call_method(
                    extractor,
                    "readSampleData",
                    "(Ljava/nio/ByteBuffer;I)I",
                    &[JValue::Object(&buffer), JValue::Int(0)],
                )?
                .i()?;
            Ok(size)
        })?;
        if size < 0 {
            return Ok(None);
        }
        Ok(Some(size as usize))
    }

    fn advance(&mut self) -> bool {
        if self.released {
            return false;
        }
        let extractor = &self.extractor;
        let advanced = jvm::call("MediaExtractor.advance", VideoError::SourceUnreadable, |env| {
            Ok(env.call_method(extractor, "advance", "()Z", &[])?.z()?)
        });
        match advanced {
            Ok(true) => {
                self.refresh_sample_info();
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!("AndroidSource: {e}");
                false
            }
        }
    }

    fn sample_time_us(&self) -> i64 {
        self.sample_time_us
    }

    fn sample_flags(&self) -> BufferFlags {
        self.sample_flags
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        release_extractor(&self.extractor);
        tracing::debug!("AndroidSource: released");
    }
}

impl Drop for AndroidSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn release_extractor(extractor: &GlobalRef) {
    jvm::call_quietly("MediaExtractor.release", |env| {
        env.call_method(extractor, "release", "()V", &[])?;
        Ok(())
    });
}

fn set_data_source(
    env: &mut JNIEnv,
    extractor: &JObject,
    context: Option<&GlobalRef>,
    locator: &str,
) -> Result<(), JniFailure> {
    let jlocator = env.new_string(locator)?;
    let is_uri = URI_SCHEMES.iter().any(|scheme| locator.starts_with(scheme));
    match context {
        Some(context) if is_uri => {
            let uri = env
                .call_static_method(
                    "android/net/Uri",
                    "parse",
                    "(Ljava/lang/String;)Landroid/net/Uri;",
                    &[JValue::Object(&jlocator)],
                )?
                .l()?;
            env.call_method(
                extractor,
                "setDataSource",
                "(Landroid/content/Context;Landroid/net/Uri;Ljava/util/Map;)V",
                &[
                    JValue::Object(context.as_obj()),
                    JValue::Object(&uri),
                    JValue::Object(&JObject::null()),
                ],
            )?;
        }
        _ => {
            env.call_method(
                extractor,
                "setDataSource",
                "(Ljava/lang/String;)V",
                &[JValue::Object(&jlocator)],
            )?;
        }
    }
    Ok(())
}

fn has_key(env: &mut JNIEnv, format: &JObject, key: &str) -> Result<bool, JniFailure> {
    let key = env.new_string(key)?;
    Ok(env
        .call_method(
            format,
            "containsKey",
            "(Ljava/lang/String;)Z",
            &[JValue::Object(&key)],
        )?
        .z()?)
}

pub(crate) fn format_int(
    env: &mut JNIEnv,
    format: &JObject,
    key: &str,
) -> Result<Option<i32>, JniFailure> {
    if !has_key(env, format, key)? {
        return Ok(None);
    }
    let jkey = env.new_string(key)?;
    let value = env
        .call_method(
            format,
            "getInteger",
            "(Ljava/lang/String;)I",
            &[JValue::Object(&jkey)],
        )?
        .i()?;
    Ok(Some(value))
}

fn format_long(env: &mut JNIEnv, format: &JObject, key: &str) -> Result<Option<i64>, JniFailure> {
    if !has_key(env, format, key)? {
        return Ok(None);
    }
    let jkey = env.new_string(key)?;
    let value = env
        .call_method(
            format,
            "getLong",
            "(Ljava/lang/String;)J",
            &[JValue::Object(&jkey)],
        )?
        .j()?;
    Ok(Some(value))
}

fn format_string(
    env: &mut JNIEnv,
    format: &JObject,
    key: &str,
) -> Result<Option<String>, JniFailure> {
    let jkey = env.new_string(key)?;
    let value = env
        .call_method(
            format,
            "getString",
            "(Ljava/lang/String;)Ljava/lang/String;",
            &[JValue::Object(&jkey)],
        )?
        .l()?;
    if value.is_null() {
        return Ok(None);
    }
    let value: String = env.get_string(&JString::from(value))?.into();
    Ok(Some(value))
}

fn read_track_format(env: &mut JNIEnv, format: &JObject) -> Result<MediaFormat, JniFailure> {
    let mime = format_string(env, format, "mime")?.unwrap_or_default();
    if !mime.starts_with("video/") {
        return Ok(MediaFormat::other(mime));
    }
    let width = format_int(env, format, "width")?.unwrap_or(0).max(0) as u32;
    let height = format_int(env, format, "height")?.unwrap_or(0).max(0) as u32;
    let mut media = MediaFormat::video(mime, width, height);
    media.duration = format_long(env, format, "durationUs")?
        .filter(|us| *us > 0)
        .map(|us| Duration::from_micros(us as u64));
    // Some extractors store the frame rate as a float.
    let frame_rate = match format_int(env, format, "frame-rate") {
        Ok(fps) => fps,
        Err(_) => {
            jvm::take_exception(env);
            None
        }
    };
    media.frame_rate = frame_rate.filter(|fps| *fps > 0).map(|fps| fps as f32);
    media.rotation = Rotation::from_degrees(format_int(env, format, "rotation-degrees")?.unwrap_or(0));
    Ok(media)
}
