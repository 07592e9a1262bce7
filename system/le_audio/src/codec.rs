// Copyright 2024, The Android Open Source Project
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


//! Host side LC3 path: PCM from the local HAL is encoded per CIS, payloads received on the
//! CISes are decoded and paired back into one PCM stream.

use crate::group::StreamParameters;
use crate::interfaces::{Lc3Decoder, Lc3Encoder, Lc3Factory};
use crate::utils::{frame_samples, mono_blend};
use log::{debug, warn};

const LEFT: usize = 0;
const RIGHT: usize = 1;

fn channel_index(stream: &(u16, crate::types::AudioLocations)) -> usize {
    if stream.1.is_right() && !stream.1.is_left() {
        RIGHT
    } else {
        LEFT
    }
}

/// Encodes the audio going to the remote sinks.
pub struct LeAudioEncoder {
    encoders: Vec<Box<dyn Lc3Encoder>>,
    frame_samples: usize,
    octets_per_frame: usize,
}

impl LeAudioEncoder {
    pub fn new(factory: &dyn Lc3Factory, params: &StreamParameters) -> Self {
        let encoders = (0..2)
            .map(|_| factory.encoder(params.frame_duration_us, params.sample_frequency_hz))
            .collect();
        Self {
            encoders,
            frame_samples: frame_samples(params.frame_duration_us, params.sample_frequency_hz),
            octets_per_frame: params.octets_per_codec_frame as usize,
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Encodes one frame of interleaved PCM with `channels` channels. Returns the payload of
    /// each stream of `params`.
    pub fn encode(
        &mut self,
        pcm: &[i16],
        channels: usize,
        params: &StreamParameters,
    ) -> Vec<(u16, Vec<u8>)> {
        let channels = channels.max(1);
        if pcm.len() < self.frame_samples * channels {
            warn!("Short PCM frame: {} samples, {} expected", pcm.len(), self.frame_samples * channels);
            return Vec::new();
        }
        let single_stream = params.streams.len() == 1;
        let mut out = Vec::with_capacity(params.streams.len());
        for stream in &params.streams {
            let (cis_conn_hdl, allocation) = *stream;
            let payload = if allocation.channel_count() >= 2 {
                let mut payload = self.encode_channel(pcm, channels, LEFT);
                payload.extend(self.encode_channel(pcm, channels, RIGHT));
                payload
            } else if single_stream && channels == 2 {
                let mono = mono_blend(pcm, self.frame_samples);
                self.encoders[LEFT].encode(&mono, 1, self.octets_per_frame)
            } else {
                self.encode_channel(pcm, channels, channel_index(stream))
            };
            out.push((cis_conn_hdl, payload));
        }
        out
    }

    fn encode_channel(&mut self, pcm: &[i16], channels: usize, channel: usize) -> Vec<u8> {
        let offset = channel.min(channels - 1);
        self.encoders[channel].encode(&pcm[offset..], channels, self.octets_per_frame)
    }
}

struct CachedFrame {
    channel: usize,
    timestamp: u32,
    samples: Vec<i16>,
}

/// Decodes the audio received from the remote sources.
pub struct LeAudioDecoder {
    decoders: Vec<Box<dyn Lc3Decoder>>,
    frame_samples: usize,
    octets_per_frame: usize,
    output_channels: usize,
    cached: Option<CachedFrame>,
}

impl LeAudioDecoder {
    pub fn new(factory: &dyn Lc3Factory, params: &StreamParameters, output_channels: usize) -> Self {
        let decoders = (0..2)
            .map(|_| factory.decoder(params.frame_duration_us, params.sample_frequency_hz))
            .collect();
        Self {
            decoders,
            frame_samples: frame_samples(params.frame_duration_us, params.sample_frequency_hz),
            octets_per_frame: params.octets_per_codec_frame as usize,
            output_channels: output_channels.clamp(1, 2),
            cached: None,
        }
    }

    /// Decodes the payload received on a CIS. Returns the PCM frames ready for the local HAL,
    /// interleaved with the output channel count.
    ///
    /// With one CIS per channel, a frame waits for the frame of the other channel carrying the
    /// same timestamp. A cached frame is sent alone when the same channel repeats or another
    /// timestamp shows up, the other side being silent.
    pub fn decode(
        &mut self,
        cis_conn_hdl: u16,
        payload: &[u8],
        timestamp: u32,
        params: &StreamParameters,
    ) -> Vec<Vec<i16>> {
        let Some(stream) = params.streams.iter().find(|(hdl, _)| *hdl == cis_conn_hdl) else {
            warn!("No source stream on CIS {:#06x}", cis_conn_hdl);
            return Vec::new();
        };
        if params.streams.len() == 1 {
            if stream.1.channel_count() >= 2 && payload.len() >= 2 * self.octets_per_frame {
                let (left, right) = payload.split_at(self.octets_per_frame);
                let left = self.decoders[LEFT].decode(left, self.frame_samples);
                let right = self.decoders[RIGHT].decode(right, self.frame_samples);
                return vec![self.stereo_frame(&left, &right)];
            }
            let mono = self.decoders[LEFT].decode(payload, self.frame_samples);
            return vec![self.mono_frame(&mono)];
        }

        let channel = channel_index(stream);
        let samples = self.decoders[channel].decode(payload, self.frame_samples);
        match self.cached.take() {
            None => {
                self.cached = Some(CachedFrame { channel, timestamp, samples });
                Vec::new()
            }
            Some(cached) if cached.channel != channel && cached.timestamp == timestamp => {
                let (left, right) = if channel == RIGHT {
                    (cached.samples, samples)
                } else {
                    (samples, cached.samples)
                };
                vec![self.stereo_frame(&left, &right)]
            }
            Some(cached) => {
                debug!(
                    "Flushing channel {} at {}, got channel {} at {}",
                    cached.channel, cached.timestamp, channel, timestamp
                );
                let flushed = self.mono_frame(&cached.samples);
                self.cached = Some(CachedFrame { channel, timestamp, samples });
                vec![flushed]
            }
        }
    }

    /// Drops the frame waiting for its pair.
    pub fn reset(&mut self) {
        self.cached = None;
    }

    fn mono_frame(&self, mono: &[i16]) -> Vec<i16> {
        if self.output_channels == 1 {
            return mono.to_vec();
        }
        mono.iter().flat_map(|s| [*s, *s]).collect()
    }

    fn stereo_frame(&self, left: &[i16], right: &[i16]) -> Vec<i16> {
        let interleaved: Vec<i16> =
            left.iter().zip(right.iter()).flat_map(|(l, r)| [*l, *r]).collect();
        if self.output_channels == 2 {
            return interleaved;
        }
        mono_blend(&interleaved, left.len().min(right.len()))
    }
}
