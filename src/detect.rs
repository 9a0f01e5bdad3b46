//! Keyword routing: pick a query type from the question text.

use crate::protocol::QueryType;

const FINANCIAL: &[&str] = &[
    "财务", "健康度", "杜邦", "现金流质量", "多期对比",
    "financial health", "dupont", "cash flow quality", "balance sheet",
];

const RAG: &[&str] = &[
    "公告", "年报", "季报", "战略", "优势", "分析",
    "announcement", "annual report", "quarterly report", "strategy", "advantage", "analy",
];

const SQL: &[&str] = &[
    "股价", "涨幅", "市值", "成交量", "排名", "资金流向",
    "stock price", "share price", "gain", "market cap", "volume", "ranking", "top ", "money flow",
];

/// Route a question by keyword.
///
/// Groups are checked in order: financial analysis, document retrieval,
/// structured data. The first group with a hit wins; no hit means `Hybrid`.
pub fn detect_query_type(question: &str) -> QueryType {
    let q = question.to_lowercase();
    let hit = |words: &[&str]| words.iter().any(|w| q.contains(w));
    if hit(FINANCIAL) {
        QueryType::FinancialAnalysis
    } else if hit(RAG) {
        QueryType::Rag
    } else if hit(SQL) {
        QueryType::Sql
    } else {
        QueryType::Hybrid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("分析贵州茅台的财务健康度", QueryType::FinancialAnalysis)]
    #[case("茅台的杜邦分析", QueryType::FinancialAnalysis)]
    #[case("贵州茅台2024年年报的主要内容", QueryType::Rag)]
    #[case("平安银行的技术走势分析", QueryType::Rag)]
    #[case("A股市值排名前10", QueryType::Sql)]
    #[case("茅台最近的资金流向", QueryType::Sql)]
    #[case("你好", QueryType::Hybrid)]
    #[case("What is the Market Cap of Ping An?", QueryType::Sql)]
    #[case("Run a DuPont breakdown for Moutai", QueryType::FinancialAnalysis)]
    #[case("hello there", QueryType::Hybrid)]
    fn routes_by_keyword(#[case] question: &str, #[case] expected: QueryType) {
        assert_eq!(detect_query_type(question), expected);
    }

    #[test]
    fn financial_wins_over_rag() {
        // "分析" is a retrieval keyword but financial words are checked first.
        assert_eq!(detect_query_type("财务分析"), QueryType::FinancialAnalysis);
    }

    #[test]
    fn empty_question_is_hybrid() {
        assert_eq!(detect_query_type(""), QueryType::Hybrid);
    }
}
