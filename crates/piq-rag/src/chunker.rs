use once_cell::sync::Lazy;
use piq_core::{Chunk, ChunkMetadata};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// 空行视为段落边界
static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n").expect("paragraph regex is valid"));

/// 句末标点后跟空白
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+").expect("sentence regex is valid"));

/// 分块配置，长度均按字符计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

/// 按段落切分文本，超长段落再按句子切分，相邻块之间保留固定长度的重叠。
///
/// 长度上限是尽力而为的：单个超长句子会原样成为一个块，内容不会被丢弃。
#[derive(Debug, Clone, Default)]
pub struct TextChunker {
    config: ChunkerConfig,
}

impl TextChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// 将文档文本切分为有序的块序列；空文本返回空序列
    pub fn chunk(
        &self,
        text: &str,
        document_id: &str,
        metadata: Option<&ChunkMetadata>,
    ) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chunk_size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut buffer = String::new();
        let mut buffer_len = 0usize;

        for para in self.split_paragraphs(text) {
            let para_len = char_len(&para);

            if buffer_len + para_len <= chunk_size {
                buffer.push_str(&para);
                buffer.push_str("\n\n");
                buffer_len += para_len + 2;
                continue;
            }

            let flushed = buffer.trim();
            if !flushed.is_empty() {
                chunks.push(Chunk::new(
                    document_id,
                    chunks.len(),
                    flushed.to_string(),
                    metadata.cloned(),
                ));
            }

            match chunks.last() {
                Some(last) if overlap > 0 => {
                    buffer = format!("{}\n\n{}\n\n", tail_chars(&last.text, overlap), para);
                    buffer_len = char_len(&buffer);
                }
                _ => {
                    buffer = format!("{}\n\n", para);
                    buffer_len = para_len + 2;
                }
            }
        }

        let rest = buffer.trim();
        if !rest.is_empty() {
            chunks.push(Chunk::new(
                document_id,
                chunks.len(),
                rest.to_string(),
                metadata.cloned(),
            ));
        }

        chunks
    }

    /// 段落切分；超过 chunk_size 的段落按句子重新组合为若干片段
    fn split_paragraphs(&self, text: &str) -> Vec<String> {
        let chunk_size = self.config.chunk_size;
        let mut result = Vec::new();

        for para in PARAGRAPH_BREAK.split(text) {
            let para = para.trim();
            if para.is_empty() {
                continue;
            }

            if char_len(para) <= chunk_size {
                result.push(para.to_string());
                continue;
            }

            let mut current = String::new();
            let mut current_len = 0usize;
            for sentence in split_sentences(para) {
                let sentence_len = char_len(sentence);
                if current_len + sentence_len <= chunk_size {
                    current.push_str(sentence);
                    current.push(' ');
                    current_len += sentence_len + 1;
                } else {
                    if !current.is_empty() {
                        result.push(current.trim().to_string());
                    }
                    current = format!("{} ", sentence);
                    current_len = sentence_len + 1;
                }
            }
            if !current.is_empty() {
                result.push(current.trim().to_string());
            }
        }

        result
    }
}

/// 在句末标点之后切分，标点保留在句子末尾
fn split_sentences(para: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(para) {
        // 标点均为单字节 ASCII
        sentences.push(&para[start..m.start() + 1]);
        start = m.end();
    }
    if start < para.len() {
        sentences.push(&para[start..]);
    }
    sentences
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// 末尾 n 个字符；不足 n 个时返回整个字符串
fn tail_chars(s: &str, n: usize) -> &str {
    let count = char_len(s);
    if count <= n {
        return s;
    }
    match s.char_indices().nth(count - n) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunker(chunk_size: usize, chunk_overlap: usize) -> TextChunker {
        TextChunker::new(ChunkerConfig {
            chunk_size,
            chunk_overlap,
        })
    }

    #[test]
    fn test_empty_and_blank_text_yield_no_chunks() {
        let c = chunker(100, 20);
        assert!(c.chunk("", "doc", None).is_empty());
        assert!(c.chunk("  \n\n \t ", "doc", None).is_empty());
    }

    #[test]
    fn test_small_paragraphs_share_a_chunk() {
        let c = chunker(100, 0);
        let chunks = c.chunk("First rule.\n\nSecond rule.", "policy", None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "First rule.\n\nSecond rule.");
        assert_eq!(chunks[0].chunk_id, "policy_chunk_0");
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].word_count, 4);
    }

    #[test]
    fn test_flush_when_next_paragraph_does_not_fit() {
        let c = chunker(30, 0);
        let text = "aaaaaaaaaaaaaaaaaaaa\n\nbbbbbbbbbbbbbbbbbbbb\n\ncccc";
        let chunks = c.chunk(text, "d", None);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["aaaaaaaaaaaaaaaaaaaa", "bbbbbbbbbbbbbbbbbbbb\n\ncccc"]
        );
        assert_eq!(chunks[1].chunk_id, "d_chunk_1");
    }

    #[test]
    fn test_overlap_seeds_next_chunk_with_previous_tail() {
        let c = chunker(30, 5);
        let text = "aaaaaaaaaaaaaaaaaaaa\n\nbbbbbbbbbbbbbbbbbbbb";
        let chunks = c.chunk(text, "d", None);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "aaaaa\n\nbbbbbbbbbbbbbbbbbbbb");
    }

    #[test]
    fn test_overlap_can_push_chunk_past_size() {
        let c = chunker(30, 10);
        let text = format!("{}\n\n{}\n\ncc", "a".repeat(25), "b".repeat(25));
        let chunks = c.chunk(&text, "d", None);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].char_count, 25);
        assert_eq!(
            chunks[1].text,
            format!("{}\n\n{}", "a".repeat(10), "b".repeat(25))
        );
        assert_eq!(chunks[1].char_count, 37);
        assert!(chunks[1].char_count <= 30 + 10 + 2);
        assert_eq!(chunks[2].text, format!("{}\n\ncc", "b".repeat(10)));
    }

    #[test]
    fn test_long_paragraph_is_split_on_sentences() {
        let c = chunker(25, 0);
        let text = "Data must be encrypted. Keys rotate yearly! Who audits? The board.";
        let chunks = c.chunk(text, "d", None);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "Data must be encrypted.",
                "Keys rotate yearly!",
                "Who audits? The board."
            ]
        );
    }

    #[test]
    fn test_oversized_first_sentence_is_kept_whole() {
        let c = chunker(10, 3);
        let text = "Thisisaverylongsentencewithoutbreaks.\n\nShort.";
        let chunks = c.chunk(text, "d", None);
        assert_eq!(chunks[0].text, "Thisisaverylongsentencewithoutbreaks.");
        assert!(chunks.iter().any(|c| c.text.ends_with("Short.")));
    }

    #[test]
    fn test_metadata_is_attached_to_every_chunk() {
        let mut meta = ChunkMetadata::new();
        meta.insert("filename".to_string(), "gdpr.pdf".to_string());
        let c = chunker(30, 0);
        let text = "aaaaaaaaaaaaaaaaaaaa\n\nbbbbbbbbbbbbbbbbbbbb";
        let chunks = c.chunk(text, "d", Some(&meta));
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.meta("filename") == Some("gdpr.pdf")));
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        assert_eq!(tail_chars("数据保护条例", 2), "条例");
        assert_eq!(tail_chars("abc", 10), "abc");
    }

    fn arb_text() -> impl Strategy<Value = String> {
        let sentence = proptest::collection::vec("[a-z]{1,9}", 1..8)
            .prop_map(|words| format!("{}.", words.join(" ")));
        let paragraph =
            proptest::collection::vec(sentence, 1..6).prop_map(|sentences| sentences.join(" "));
        proptest::collection::vec(paragraph, 1..8).prop_map(|paras| paras.join("\n\n"))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn chunks_reconstruct_paragraph_sequence(text in arb_text(), size in 20usize..200) {
            let c = chunker(size, 0);
            let rebuilt: Vec<String> = c
                .chunk(&text, "doc", None)
                .iter()
                .flat_map(|chunk| chunk.text.split("\n\n").map(str::to_string).collect::<Vec<_>>())
                .collect();
            prop_assert_eq!(rebuilt, c.split_paragraphs(&text));
        }

        #[test]
        fn oversized_chunks_hold_a_single_fragment(text in arb_text(), size in 20usize..200) {
            let c = chunker(size, 0);
            for chunk in c.chunk(&text, "doc", None) {
                prop_assert!(chunk.char_count <= size || !chunk.text.contains("\n\n"));
            }
        }

        #[test]
        fn overlapping_chunks_stay_within_size_plus_overlap(
            text in arb_text(),
            size in 20usize..200,
            overlap in 1usize..30,
        ) {
            let c = chunker(size, overlap);
            for chunk in c.chunk(&text, "doc", None) {
                let last_fragment = chunk.text.rsplit("\n\n").next().map_or(0, char_len);
                prop_assert!(chunk.char_count <= size + overlap + 2 || last_fragment > size);
            }
        }

        #[test]
        fn each_chunk_starts_with_previous_tail(
            text in arb_text(),
            size in 20usize..200,
            overlap in 1usize..30,
        ) {
            let c = chunker(size, overlap);
            let chunks = c.chunk(&text, "doc", None);
            for pair in chunks.windows(2) {
                let tail = tail_chars(&pair[0].text, overlap).trim_start();
                prop_assert!(pair[1].text.starts_with(tail));
            }
        }

        #[test]
        fn chunking_is_deterministic(
            text in arb_text(),
            size in 20usize..200,
            overlap in 0usize..30,
        ) {
            let c = chunker(size, overlap);
            let first = c.chunk(&text, "doc", None);
            let second = c.chunk(&text, "doc", None);
            prop_assert_eq!(first.len(), second.len());
            for (a, b) in first.iter().zip(second.iter()) {
                prop_assert_eq!(&a.chunk_id, &b.chunk_id);
                prop_assert_eq!(&a.text, &b.text);
            }
            for (i, chunk) in first.iter().enumerate() {
                prop_assert_eq!(chunk.chunk_index, i);
            }
        }
    }
}
