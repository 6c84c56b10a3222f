use std::collections::HashMap;
use std::fs::File;
use std::io::BufRead;
use std::path::Path;
use std::{io, mem};

use ecow::EcoString;
use serde::Deserialize;
use thiserror::Error;
use unicode_general_category::{get_general_category, GeneralCategory};
use unicode_normalization::UnicodeNormalization;

use super::Token;

const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";

/// Byte-level BPE tokenizer compatible with the Qwen2 tokenizer files.
#[derive(Debug)]
pub struct BpeTokenizer {
    pad_token: Token,
    vocab: HashMap<EcoString, Token>,
    merges: HashMap<(EcoString, EcoString), usize>,
    special: Vec<(EcoString, Token)>,
    byte_table: [char; 256],
}

impl BpeTokenizer {
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let config_file = File::open(directory.as_ref().join("tokenizer_config.json"))?;
        let config: TokenizerConfig = serde_json::from_reader(io::BufReader::new(config_file))?;

        if config.tokenizer_class != "Qwen2Tokenizer" {
            return Err(TokenizerError::UnsupportedTokenizer(config.tokenizer_class));
        }

        let source = io::BufReader::new(File::open(directory.as_ref().join("vocab.json"))?);
        let vocab: HashMap<EcoString, Token> = serde_json::from_reader(source)?;

        let merges = io::BufReader::new(File::open(directory.as_ref().join("merges.txt"))?)
            .lines()
            .filter(|line| {
                !matches!(line, Ok(line) if line.starts_with("#version") || line.is_empty())
            })
            .enumerate()
            .map(|(rank, line)| {
                let line = line?;
                let (lhs, rhs) = line.split_once(' ').ok_or(TokenizerError::InvalidMerges)?;
                Ok(((lhs.into(), rhs.into()), rank))
            })
            .collect::<Result<_, TokenizerError>>()?;

        let mut special = config
            .added_tokens_decoder
            .into_iter()
            .map(|(id, token)| {
                let id = id
                    .parse()
                    .map_err(|_| TokenizerError::InvalidAddedToken(id.clone()))?;
                Ok((EcoString::from(token.content), id))
            })
            .collect::<Result<Vec<_>, TokenizerError>>()?;
        // longest first so that overlapping specials resolve to the longer one
        special.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let pad_content = config
            .pad_token
            .map(TokenRepr::into_content)
            .unwrap_or_else(|| DEFAULT_PAD_TOKEN.to_owned());
        let pad_token = special
            .iter()
            .find(|(content, _)| content.as_str() == pad_content)
            .map(|&(_, id)| id)
            .or_else(|| vocab.get(pad_content.as_str()).copied())
            .ok_or(TokenizerError::MissingPadToken)?;

        Ok(Self {
            pad_token,
            vocab,
            merges,
            special,
            byte_table: byte_table(),
        })
    }

    pub fn encode(&self, text: impl AsRef<str>) -> Vec<Token> {
        let text: String = text.as_ref().nfc().collect();
        let mut tokens = vec![];
        let mut rest = text.as_str();

        while !rest.is_empty() {
            let (plain, special) = self.split_special(rest);
            self.encode_plain(plain, &mut tokens);
            match special {
                Some((token, remainder)) => {
                    tokens.push(token);
                    rest = remainder;
                }
                None => break,
            }
        }
        tokens
    }

    pub fn pad_token(&self) -> Token {
        self.pad_token
    }

    fn split_special<'a>(&self, text: &'a str) -> (&'a str, Option<(Token, &'a str)>) {
        let earliest = self
            .special
            .iter()
            .filter_map(|(content, id)| text.find(content.as_str()).map(|pos| (pos, content, *id)))
            .min_by_key(|&(pos, _, _)| pos);

        match earliest {
            Some((pos, content, id)) => (&text[..pos], Some((id, &text[pos + content.len()..]))),
            None => (text, None),
        }
    }

    fn encode_plain(&self, text: &str, tokens: &mut Vec<Token>) {
        for chunk in ChunkIter::new(text) {
            let chunk = chunk
                .bytes()
                .map(|c| self.byte_table[usize::from(c)])
                .collect::<EcoString>();
            let words = self
                .bpe(&chunk)
                .into_iter()
                .filter_map(|word| self.vocab.get(&word));
            tokens.extend(words);
        }
    }

    fn bpe(&self, chunk: &str) -> Vec<EcoString> {
        let mut words: Vec<_> = chunk.chars().map(EcoString::from).collect();
        let mut scratch: Vec<EcoString> = Vec::with_capacity(words.len());

        while words.len() > 1 {
            let Some(((fst, snd), _)) = words
                .iter()
                .zip(words.iter().skip(1))
                .filter_map(|(fst, snd)| self.merges.get_key_value(&(fst.clone(), snd.clone())))
                .min_by_key(|(_, &rank)| rank)
            else {
                break;
            };

            for word in words.drain(..) {
                match scratch.last_mut() {
                    Some(last) if &word == snd && last == fst => last.push_str(snd),
                    _ => scratch.push(word),
                }
            }
            mem::swap(&mut words, &mut scratch);
        }

        words
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenizerError {
    #[error("missing pad token in the vocabulary")]
    MissingPadToken,
    #[error("failed to parse tokenizer JSON config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("unsupported tokenizer class: {0}")]
    UnsupportedTokenizer(String),
    #[error("invalid added token id: {0}")]
    InvalidAddedToken(String),
    #[error("invalid merges file")]
    InvalidMerges,
    #[error("I/O error when loading the tokenizer: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    tokenizer_class: String,
    #[serde(default)]
    added_tokens_decoder: HashMap<String, AddedToken>,
    #[serde(default)]
    pad_token: Option<TokenRepr>,
}

#[derive(Debug, Deserialize)]
struct AddedToken {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenRepr {
    Plain(String),
    Object { content: String },
}

impl TokenRepr {
    fn into_content(self) -> String {
        match self {
            Self::Plain(content) | Self::Object { content } => content,
        }
    }
}

/// Maps every byte to a printable char, the GPT-2 way.
fn byte_table() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut next = 256;
    for byte in 0..=u8::MAX {
        table[usize::from(byte)] = if matches!(byte, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF) {
            char::from(byte)
        } else {
            let c = char::from_u32(next).unwrap_or(char::REPLACEMENT_CHARACTER);
            next += 1;
            c
        };
    }
    table
}

/// Pre-tokenizer following the Qwen2 split pattern.
struct ChunkIter<'a> {
    inner: &'a str,
}

impl<'a> ChunkIter<'a> {
    fn new(inner: &'a str) -> Self {
        Self { inner }
    }

    #[inline]
    fn split_off(&mut self, n: usize) -> &'a str {
        let (ret, rest) = self.inner.split_at(n);
        self.inner = rest;
        ret
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let text = self.inner;
        let first = text.chars().next()?;

        if let [b'\'', c0, c1, ..] = text.as_bytes() {
            match [c0.to_ascii_lowercase(), c1.to_ascii_lowercase()] {
                [b'r', b'e'] | [b'v', b'e'] | [b'l', b'l'] => return Some(self.split_off(3)),
                [b's' | b't' | b'm' | b'd', _] => return Some(self.split_off(2)),
                _ => {}
            }
        } else if let [b'\'', b's' | b't' | b'm' | b'd' | b'S' | b'T' | b'M' | b'D'] =
            text.as_bytes()
        {
            return Some(self.split_off(2));
        }

        if is_letter(first) {
            return Some(self.split_off(prefix_len(text, is_letter)));
        }
        if !is_newline(first) && !is_number(first) {
            let letters = prefix_len(&text[first.len_utf8()..], is_letter);
            if letters > 0 {
                return Some(self.split_off(first.len_utf8() + letters));
            }
        }
        if is_number(first) {
            return Some(self.split_off(first.len_utf8()));
        }

        let space = usize::from(first == ' ');
        let punct = prefix_len(&text[space..], |c| {
            !c.is_whitespace() && !is_letter(c) && !is_number(c)
        });
        if punct > 0 {
            let n = space + punct;
            return Some(self.split_off(n + prefix_len(&text[n..], is_newline)));
        }

        let ws = prefix_len(text, char::is_whitespace);
        if let Some(i) = text[..ws].rfind(is_newline) {
            return Some(self.split_off(i + 1));
        }
        if ws == text.len() || ws == first.len_utf8() {
            return Some(self.split_off(ws));
        }
        // leave the last whitespace char to prefix the next word
        let last = text[..ws].chars().next_back().map_or(0, char::len_utf8);
        Some(self.split_off(ws - last))
    }
}

/// `\p{L}`, which unlike `char::is_alphabetic` excludes letter numbers and combining marks.
fn is_letter(c: char) -> bool {
    matches!(
        get_general_category(c),
        GeneralCategory::UppercaseLetter
            | GeneralCategory::LowercaseLetter
            | GeneralCategory::TitlecaseLetter
            | GeneralCategory::ModifierLetter
            | GeneralCategory::OtherLetter
    )
}

/// `\p{N}`
fn is_number(c: char) -> bool {
    matches!(
        get_general_category(c),
        GeneralCategory::DecimalNumber
            | GeneralCategory::LetterNumber
            | GeneralCategory::OtherNumber
    )
}

fn is_newline(c: char) -> bool {
    c == '\r' || c == '\n'
}

fn prefix_len(text: &str, pred: impl Fn(char) -> bool) -> usize {
    text.char_indices()
        .find(|&(_, c)| !pred(c))
        .map_or(text.len(), |(i, _)| i)
}
