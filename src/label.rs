// 该文件是 Shanan （山南西风） 项目的一部分。
// src/label.rs - 类别标签
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

const MAX_LABEL_FILE_SIZE: u64 = 1024 * 1024;
const MAX_LABEL_LENGTH: usize = 60;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件为空")]
  Empty,
  #[error("标签文件过大: {0} 字节")]
  TooLarge(u64),
}

/// 有序类别名列表，下标即类别编号
#[derive(Debug, Clone, Default)]
pub struct LabelSet {
  labels: Box<[Arc<str>]>,
}

impl LabelSet {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let size = std::fs::metadata(path)?.len();
    if size > MAX_LABEL_FILE_SIZE {
      return Err(LabelError::TooLarge(size));
    }

    let text = std::fs::read_to_string(path)?;
    let labels = Self::parse(&text)?;
    info!("从 {} 加载了 {} 个标签", path.display(), labels.len());
    Ok(labels)
  }

  /// 每行一个标签；兼容 CRLF，过长的标签会被截断
  pub fn parse(text: &str) -> Result<Self, LabelError> {
    if text.is_empty() {
      return Err(LabelError::Empty);
    }

    let labels = text
      .lines()
      .map(|line| {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let truncated: String = line.chars().take(MAX_LABEL_LENGTH).collect();
        Arc::<str>::from(truncated)
      })
      .collect::<Vec<_>>();

    if labels.is_empty() {
      return Err(LabelError::Empty);
    }

    Ok(Self {
      labels: labels.into_boxed_slice(),
    })
  }

  pub fn from_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    Self {
      labels: names.into_iter().map(|s| Arc::from(s.as_ref())).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  /// 查找类别名，越界时回退为 `class_<id>`
  pub fn get(&self, class_id: usize) -> Arc<str> {
    match self.labels.get(class_id) {
      Some(label) => label.clone(),
      None => Arc::from(format!("class_{}", class_id)),
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.labels.iter().map(|label| label.as_ref())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn parses_lines_with_crlf_and_trailing_newline() {
    let labels = LabelSet::parse("person\r\nbicycle\ncar\n").unwrap();
    assert_eq!(labels.len(), 3);
    assert_eq!(&*labels.get(0), "person");
    assert_eq!(&*labels.get(1), "bicycle");
    assert_eq!(&*labels.get(2), "car");
  }

  #[test]
  fn out_of_range_falls_back_to_synthetic_name() {
    let labels = LabelSet::from_names(["person"]);
    assert_eq!(&*labels.get(7), "class_7");
  }

  #[test]
  fn long_labels_are_truncated() {
    let long = "x".repeat(100);
    let labels = LabelSet::parse(&long).unwrap();
    assert_eq!(labels.get(0).len(), 60);
  }

  #[test]
  fn empty_file_is_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    assert!(matches!(
      LabelSet::from_file(file.path()),
      Err(LabelError::Empty)
    ));
  }

  #[test]
  fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cat").unwrap();
    write!(file, "dog").unwrap();
    let labels = LabelSet::from_file(file.path()).unwrap();
    assert_eq!(labels.iter().collect::<Vec<_>>(), vec!["cat", "dog"]);
  }
}
