mod common;

use std::fs;

use common::{write_corpus, CORPUS_HEADER, PAIRS};
use mt5_translator::data::{corpus_files, load_corpus, train_test_split, SentencePair};
use mt5_translator::TranslatorError;

#[test]
fn corpus_directory_is_concatenated_in_file_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_corpus(dir.path(), "b.csv", &PAIRS[3..])?;
    write_corpus(dir.path(), "a.csv", &PAIRS[..3])?;
    fs::write(dir.path().join("notes.txt"), "not a corpus")?;
    fs::create_dir(dir.path().join("nested.csv"))?;

    let files = corpus_files(dir.path())?;
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("a.csv"));

    let corpus = load_corpus(dir.path())?;
    assert_eq!(corpus.len(), PAIRS.len());
    for (pair, (korean, english)) in corpus.iter().zip(PAIRS.iter()) {
        assert_eq!(pair.korean, *korean);
        assert_eq!(pair.english, *english);
    }
    assert_eq!(corpus[2].korean_length, Some(2));
    assert_eq!(corpus[2].english_length, Some(2));
    Ok(())
}

#[test]
fn rows_with_missing_values_are_dropped() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let content = format!(
        "{CORPUS_HEADER}\n\
         1,일상,안녕하세요,Hello,1,1,1,기관,짧음\n\
         2,일상,,Missing Korean,0,2,1,기관,짧음\n\
         3,일상,감사합니다,Thank you,1,2,1,,짧음\n\
         4,일상,잘 자요,Good night,2,2,1,기관,NaN\n\
         5,일상,사랑해요,I love you,1,3,1,기관,짧음\n"
    );
    fs::write(dir.path().join("corpus.csv"), content)?;

    let corpus = load_corpus(dir.path())?;
    assert_eq!(
        corpus
            .iter()
            .map(|pair| pair.english.as_str())
            .collect::<Vec<&str>>(),
        vec!["Hello", "I love you"]
    );
    Ok(())
}

#[test]
fn missing_translation_column_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("corpus.csv"), "sid,한국어\n1,안녕하세요\n")?;

    let result = load_corpus(dir.path());
    assert!(matches!(result, Err(TranslatorError::DatasetError(_))));
    Ok(())
}

#[test]
fn empty_directory_yields_empty_corpus() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    assert!(load_corpus(dir.path())?.is_empty());
    Ok(())
}

#[test]
fn unreadable_directory_is_an_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("validation");
    assert!(matches!(corpus_files(&missing), Err(TranslatorError::IOError(_))));
    assert!(load_corpus(&missing).is_err());
    Ok(())
}

#[test]
fn held_out_split_is_reproducible() -> anyhow::Result<()> {
    let corpus: Vec<SentencePair> = PAIRS
        .iter()
        .map(|(korean, english)| SentencePair::new(*korean, *english))
        .collect();

    let (train, test) = train_test_split(corpus.clone(), 0.3, 7)?;
    let (train_again, test_again) = train_test_split(corpus.clone(), 0.3, 7)?;
    assert_eq!(test.len(), 2);
    assert_eq!(train.len(), 4);
    assert_eq!(train, train_again);
    assert_eq!(test, test_again);
    assert!(test.iter().all(|pair| !train.contains(pair)));
    Ok(())
}
