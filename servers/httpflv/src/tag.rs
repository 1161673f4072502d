use tokio_util::bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Audio,
    Video,
    Script,
}

/// One FLV tag, already framed: tag header + payload + prev-tag-size. The
/// fan-out path treats `raw` as opaque bytes.
#[derive(Debug, Clone)]
pub struct MediaTag {
    pub kind: TagKind,
    pub is_keyframe: bool,
    pub raw: Bytes,
}

impl MediaTag {
    #[inline]
    pub fn is_video_keyframe(&self) -> bool {
        self.kind == TagKind::Video && self.is_keyframe
    }
}
