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


//! Utilities that are not specific to a particular module

/// Inits logging for host
pub fn init_logging() {
    env_logger::Builder::new().parse_default_env().try_init().ok();
}

/// Samples per channel in one codec frame.
pub fn frame_samples(frame_duration_us: u32, sample_rate_hz: u32) -> usize {
    (sample_rate_hz as u64 * frame_duration_us as u64 / 1_000_000) as usize
}

/// Averages the two channels of interleaved 16-bit stereo PCM.
pub fn mono_blend(pcm: &[i16], samples_per_channel: usize) -> Vec<i16> {
    pcm.chunks_exact(2)
        .take(samples_per_channel)
        .map(|lr| ((lr[0] as i32 + lr[1] as i32) / 2) as i16)
        .collect()
}

/// Converts little-endian bytes into 16-bit samples, a trailing odd byte is dropped.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

/// Converts 16-bit samples into little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
