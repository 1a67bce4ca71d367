use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, QueryParser, TermQuery};
use tantivy::schema::*;
use tantivy::tokenizer::{LowerCaser, TextAnalyzer, Token, TokenStream, Tokenizer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

use crate::error::StorageError;

const CODE_TOKENIZER: &str = "code";
const BATCH_COUNT_THRESHOLD: usize = 500;
const BATCH_TIME_THRESHOLD: Duration = Duration::from_millis(500);
const PREVIEW_MAX_BYTES: usize = 160;

// ---------------------------------------------------------------------------
// Code-aware tokenizer
// ---------------------------------------------------------------------------

/// Check if a character is a CJK Unified Ideograph.
fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Ideographs
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility Ideographs
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Lower,
    Upper,
    Digit,
    Cjk,
    Other,
}

fn classify(ch: char) -> CharClass {
    if ch.is_ascii_lowercase() {
        CharClass::Lower
    } else if ch.is_ascii_uppercase() {
        CharClass::Upper
    } else if ch.is_ascii_digit() {
        CharClass::Digit
    } else if is_cjk(ch) {
        CharClass::Cjk
    } else {
        CharClass::Other
    }
}

/// Splits identifiers on camelCase, PascalCase, snake_case, and digit
/// boundaries; CJK runs are emitted as overlapping bigrams.
///
/// Examples:
/// - `HTMLParser`      → `HTML`, `Parser`
/// - `parseXMLStream`  → `parse`, `XML`, `Stream`
/// - `user_service`    → `user`, `service`
/// - `i18n`            → `i`, `18`, `n`
/// - `识别框`           → `识别`, `别框`
#[derive(Clone, Default)]
struct CodeTokenizer;

/// One pre-computed token: (text, byte_from, byte_to).
type RawToken = (String, usize, usize);

impl Tokenizer for CodeTokenizer {
    type TokenStream<'a> = CodeTokenStream;

    fn token_stream<'a>(&'a mut self, text: &'a str) -> Self::TokenStream<'a> {
        CodeTokenStream {
            tokens: split_code(text),
            token: Token::default(),
            position: usize::MAX,
        }
    }
}

struct CodeTokenStream {
    tokens: VecDeque<RawToken>,
    token: Token,
    position: usize,
}

impl TokenStream for CodeTokenStream {
    fn advance(&mut self) -> bool {
        match self.tokens.pop_front() {
            Some((text, from, to)) => {
                self.position = self.position.wrapping_add(1);
                self.token.text.clear();
                self.token.text.push_str(&text);
                self.token.offset_from = from;
                self.token.offset_to = to;
                self.token.position = self.position;
                true
            }
            None => false,
        }
    }

    fn token(&self) -> &Token {
        &self.token
    }

    fn token_mut(&mut self) -> &mut Token {
        &mut self.token
    }
}

/// Pre-tokenize `text` into camel/snake/digit subwords and CJK bigrams.
fn split_code(text: &str) -> VecDeque<RawToken> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let total = text.len();
    let end_of = |i: usize| {
        chars
            .get(i + 1)
            .map(|(off, _)| *off)
            .unwrap_or(total)
    };

    let mut out = VecDeque::new();
    let mut i = 0;
    while i < chars.len() {
        let class = classify(chars[i].1);
        match class {
            CharClass::Other => {
                i += 1;
            }
            CharClass::Cjk => {
                // Collect the full CJK run, then emit overlapping bigrams
                // (a single lone character becomes a unigram).
                let start = i;
                while i < chars.len() && classify(chars[i].1) == CharClass::Cjk {
                    i += 1;
                }
                let run = &chars[start..i];
                if run.len() == 1 {
                    out.push_back((run[0].1.to_string(), run[0].0, end_of(start)));
                } else {
                    for (j, pair) in run.windows(2).enumerate() {
                        let mut s = String::with_capacity(8);
                        s.push(pair[0].1);
                        s.push(pair[1].1);
                        out.push_back((s, pair[0].0, end_of(start + j + 1)));
                    }
                }
            }
            _ => {
                // ASCII alphanumeric run: split on case and digit boundaries.
                let start = i;
                while i < chars.len()
                    && matches!(
                        classify(chars[i].1),
                        CharClass::Lower | CharClass::Upper | CharClass::Digit
                    )
                {
                    i += 1;
                }
                split_ascii_run(&chars[start..i], end_of(i.saturating_sub(1)), &mut out);
            }
        }
    }
    out
}

/// Split one ASCII alphanumeric run into subword tokens.
fn split_ascii_run(run: &[(usize, char)], run_end: usize, out: &mut VecDeque<RawToken>) {
    let end_of = |j: usize| run.get(j + 1).map(|(off, _)| *off).unwrap_or(run_end);

    let mut j = 0;
    while j < run.len() {
        let start = j;
        match classify(run[j].1) {
            CharClass::Digit => {
                while j < run.len() && classify(run[j].1) == CharClass::Digit {
                    j += 1;
                }
            }
            CharClass::Lower => {
                while j < run.len() && classify(run[j].1) == CharClass::Lower {
                    j += 1;
                }
            }
            CharClass::Upper => {
                j += 1;
                if j < run.len() && classify(run[j].1) == CharClass::Lower {
                    // PascalCase word: "Parser", "My"
                    while j < run.len() && classify(run[j].1) == CharClass::Lower {
                        j += 1;
                    }
                } else {
                    // Uppercase run: "HTML" in "HTMLParser", standalone "HTTP".
                    // Stop before an uppercase that starts a PascalCase word.
                    while j < run.len() && classify(run[j].1) == CharClass::Upper {
                        if j + 1 < run.len() && classify(run[j + 1].1) == CharClass::Lower {
                            break;
                        }
                        j += 1;
                    }
                }
            }
            _ => unreachable!("run contains only ASCII alphanumerics"),
        }
        let text: String = run[start..j].iter().map(|(_, c)| c).collect();
        out.push_back((text, run[start].0, end_of(j - 1)));
    }
}

// ---------------------------------------------------------------------------
// Base lexical store
// ---------------------------------------------------------------------------

/// A single BM25 hit from the base lexical index.
#[derive(Debug, Clone)]
pub struct BaseLexicalHit {
    pub file_path: String,
    pub score: f32,
    /// 0-indexed line of the first matched term, when found in the stored text.
    pub line: Option<u32>,
    pub preview: Option<String>,
}

/// Base full-text index over source files, backed by Tantivy.
///
/// One document per `(repo_id, snapshot_id, file_path)`. Uses a code-aware
/// tokenizer that splits camelCase, PascalCase, snake_case, and digit
/// boundaries, with CJK bigram support.
///
/// Batched commit strategy: commits on 500 documents or 500ms elapsed,
/// whichever comes first. Forced commit on drop.
pub struct BaseLexicalStore {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    f_doc_key: Field,
    f_collection: Field,
    f_file_path: Field,
    f_content: Field,
    pending_count: usize,
    last_commit: Instant,
}

fn build_schema() -> (Schema, Field, Field, Field, Field) {
    let mut builder = Schema::builder();

    let doc_key = builder.add_text_field("doc_key", STRING | STORED);
    let collection = builder.add_text_field("collection", STRING);

    let code_text = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(CODE_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let file_path = builder.add_text_field("file_path", STRING | STORED);
    let content = builder.add_text_field("content", code_text);

    let schema = builder.build();
    (schema, doc_key, collection, file_path, content)
}

fn register_code_tokenizer(index: &Index) {
    let analyzer = TextAnalyzer::builder(CodeTokenizer)
        .filter(LowerCaser)
        .build();
    index.tokenizers().register(CODE_TOKENIZER, analyzer);
}

fn doc_key(repo_id: &str, snapshot_id: &str, file_path: &str) -> String {
    format!("{repo_id}|{snapshot_id}|{file_path}")
}

fn collection_key(repo_id: &str, snapshot_id: &str) -> String {
    format!("{repo_id}|{snapshot_id}")
}

impl BaseLexicalStore {
    /// Open or create a base lexical index at the given directory path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)?;
        let (schema, f_doc_key, f_collection, f_file_path, f_content) = build_schema();
        let index = Index::open_in_dir(path)
            .or_else(|_| Index::create_in_dir(path, schema.clone()))?;
        Self::finish_open(index, f_doc_key, f_collection, f_file_path, f_content, 50_000_000)
    }

    /// Create an in-memory base lexical index (for testing).
    pub fn create_in_ram() -> Result<Self, StorageError> {
        let (schema, f_doc_key, f_collection, f_file_path, f_content) = build_schema();
        let index = Index::create_in_ram(schema);
        Self::finish_open(index, f_doc_key, f_collection, f_file_path, f_content, 15_000_000)
    }

    fn finish_open(
        index: Index,
        f_doc_key: Field,
        f_collection: Field,
        f_file_path: Field,
        f_content: Field,
        writer_heap: usize,
    ) -> Result<Self, StorageError> {
        register_code_tokenizer(&index);
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(writer_heap)?;
        Ok(Self {
            index,
            reader,
            writer,
            f_doc_key,
            f_collection,
            f_file_path,
            f_content,
            pending_count: 0,
            last_commit: Instant::now(),
        })
    }

    /// Upsert one source file into the index.
    pub fn index_file(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(), StorageError> {
        let key = doc_key(repo_id, snapshot_id, file_path);
        self.writer
            .delete_term(Term::from_field_text(self.f_doc_key, &key));
        self.writer.add_document(doc!(
            self.f_doc_key => key,
            self.f_collection => collection_key(repo_id, snapshot_id),
            self.f_file_path => file_path,
            self.f_content => content,
        ))?;
        self.pending_count += 1;
        self.maybe_commit()?;
        Ok(())
    }

    /// Remove one file from the index.
    pub fn remove_file(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
        file_path: &str,
    ) -> Result<(), StorageError> {
        let key = doc_key(repo_id, snapshot_id, file_path);
        self.writer
            .delete_term(Term::from_field_text(self.f_doc_key, &key));
        self.pending_count += 1;
        self.maybe_commit()?;
        Ok(())
    }

    /// Delete all documents for a (repo, snapshot) collection.
    pub fn delete_collection(
        &mut self,
        repo_id: &str,
        snapshot_id: &str,
    ) -> Result<(), StorageError> {
        let key = collection_key(repo_id, snapshot_id);
        self.writer
            .delete_term(Term::from_field_text(self.f_collection, &key));
        self.writer.commit()?;
        self.reader.reload()?;
        self.pending_count = 0;
        self.last_commit = Instant::now();
        Ok(())
    }

    /// Search file documents in one collection with BM25 ranking.
    ///
    /// Query parsing is lenient: malformed query syntax degrades instead of
    /// erroring.
    #[tracing::instrument(skip(self, query), fields(result_count))]
    pub fn search(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<BaseLexicalHit>, StorageError> {
        let query_parser = QueryParser::for_index(&self.index, vec![self.f_content]);
        let (text_query, _errors) = query_parser.parse_query_lenient(query);

        let clauses: Vec<(Occur, Box<dyn tantivy::query::Query>)> = vec![
            (Occur::Must, text_query),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(
                        self.f_collection,
                        &collection_key(repo_id, snapshot_id),
                    ),
                    IndexRecordOption::Basic,
                )),
            ),
        ];
        let final_query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&final_query, &TopDocs::with_limit(limit))?;

        let needles: Vec<String> = split_code(query)
            .into_iter()
            .map(|(t, _, _)| t.to_lowercase())
            .collect();

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let retrieved: TantivyDocument = searcher.doc(doc_address)?;
            let file_path = match retrieved.get_first(self.f_file_path) {
                Some(OwnedValue::Str(s)) => s.clone(),
                _ => continue,
            };
            let (line, preview) = match retrieved.get_first(self.f_content) {
                Some(OwnedValue::Str(content)) => first_match_line(content, &needles),
                _ => (None, None),
            };
            hits.push(BaseLexicalHit {
                file_path,
                score,
                line,
                preview,
            });
        }

        tracing::Span::current().record("result_count", hits.len());
        Ok(hits)
    }

    /// Force a commit of all pending documents and refresh the reader.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        if self.pending_count > 0 {
            self.writer.commit()?;
            self.reader.reload()?;
            self.pending_count = 0;
            self.last_commit = Instant::now();
        }
        Ok(())
    }

    /// Number of documents pending commit.
    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    fn maybe_commit(&mut self) -> Result<(), StorageError> {
        if self.pending_count >= BATCH_COUNT_THRESHOLD
            || self.last_commit.elapsed() >= BATCH_TIME_THRESHOLD
        {
            self.commit()?;
        }
        Ok(())
    }
}

impl Drop for BaseLexicalStore {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}

/// Locate the first line containing any of the query tokens.
fn first_match_line(content: &str, needles: &[String]) -> (Option<u32>, Option<String>) {
    if needles.is_empty() {
        return (None, None);
    }
    for (line_no, line) in content.lines().enumerate() {
        let lower = line.to_lowercase();
        if needles.iter().any(|n| lower.contains(n.as_str())) {
            let trimmed = line.trim();
            let preview = strata_core::truncate_utf8_bytes(trimmed, PREVIEW_MAX_BYTES);
            return (Some(line_no as u32), Some(preview.to_string()));
        }
    }
    (None, None)
}
