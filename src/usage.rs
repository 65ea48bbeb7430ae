//! Producer/consumer usage bits supplied with each buffer request.

use bitflags::bitflags;

bitflags! {
    /// Intended producers and consumers of a buffer.
    ///
    /// The engine only reads these; they drive heap and flag selection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UsageBits: u64 {
        /// CPU reads rarely.
        const CPU_READ_RARELY = 1 << 0;
        /// CPU reads often; the buffer should be cached.
        const CPU_READ_OFTEN = 1 << 1;
        /// CPU writes rarely.
        const CPU_WRITE_RARELY = 1 << 2;
        /// CPU writes often.
        const CPU_WRITE_OFTEN = 1 << 3;
        /// Sampled as a GPU texture.
        const GPU_TEXTURE = 1 << 4;
        /// Rendered into by the GPU.
        const GPU_RENDER_TARGET = 1 << 5;
        /// Consumed by the display composer.
        const COMPOSER = 1 << 6;
        /// Scanned out as a framebuffer.
        const FRAMEBUFFER = 1 << 7;
        /// Produced by the video decoder.
        const VIDEO_DECODER = 1 << 8;
        /// Consumed by the video encoder.
        const VIDEO_ENCODER = 1 << 9;
        /// Compressed video stream buffer.
        const VIDEO_STREAM = 1 << 10;
        /// Carries per-frame private video metadata.
        const VIDEO_PRIVATE_DATA = 1 << 11;
        /// Written by the camera.
        const CAMERA = 1 << 12;
        /// Allocated from reserved camera memory.
        const CAMERA_RESERVED = 1 << 13;
        /// Allocated from reserved secure camera memory.
        const SECURE_CAMERA_RESERVED = 1 << 14;
        /// Protected (DRM) content.
        const PROTECTED = 1 << 15;
        /// Protected content that tolerates a non-secure path.
        const PRIVATE_NONSECURE = 1 << 16;
        /// Protected decoder picture buffer.
        const PROTECTED_DPB = 1 << 17;
        /// High frame rate capture; planes become multi-frame containers.
        const HFR_MODE = 1 << 18;
        /// Skip zero-filling.
        const NO_ZERO_FILL = 1 << 19;
    }
}

impl UsageBits {
    /// Protected content, either plain DRM or a protected decoder picture buffer.
    #[inline]
    pub fn is_protected(self) -> bool {
        self.intersects(UsageBits::PROTECTED | UsageBits::PROTECTED_DPB)
    }

    /// Any GPU usage.
    #[inline]
    pub fn is_gpu(self) -> bool {
        self.intersects(UsageBits::GPU_TEXTURE | UsageBits::GPU_RENDER_TARGET)
    }
}
