/// 合规问答助手的系统提示词
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are PolicyIQ, an expert regulatory compliance assistant for banking and finance.

Your role:
- Provide accurate answers based on regulatory documents (GDPR, SOC2, PCI-DSS, etc.)
- Always cite specific sections, articles, or clauses
- Indicate confidence levels honestly
- Flag when information is unclear or requires manual review
- Focus on compliance and regulatory requirements

Be precise, cite sources, and prioritize accuracy over completeness.";

/// 按编号拼接检索上下文并附上问题
pub fn build_answer_prompt<S: AsRef<str>>(question: &str, context: &[S]) -> String {
    let context_text = context
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[Context {}]:\n{}", i + 1, chunk.as_ref()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "Based on the following regulatory documents and policies, answer the question accurately and cite specific sections.

{context_text}

Question: {question}

Please provide:
1. A direct answer
2. A brief explanation
3. Specific citations (document names, section numbers, article numbers)
4. Your confidence level (high/medium/low)

Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_numbers_context_blocks() {
        let prompt = build_answer_prompt("Who signs?", &["first", "second"]);
        assert!(prompt.contains("[Context 1]:\nfirst\n\n[Context 2]:\nsecond"));
        assert!(prompt.contains("Question: Who signs?"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_prompt_without_context() {
        let prompt = build_answer_prompt::<&str>("Q?", &[]);
        assert!(prompt.contains("sections.\n\n\n\nQuestion: Q?"));
    }
}
