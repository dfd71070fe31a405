use crate::common_io::{read_lines_of_words, write_lines};
use crate::traits::IoOps;
use ndarray::prelude::*;

fn parse_value(word: &str) -> anyhow::Result<f64> {
    match word {
        "NA" | "na" | "NaN" | "nan" | "." => Ok(f64::NAN),
        _ => word
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("failed to parse '{}': {}", word, e)),
    }
}

impl IoOps for Array2<f64> {
    type Scalar = f64;
    type Mat = Self;

    fn from_tsv(tsv_file: &str, skip: Option<usize>) -> anyhow::Result<Self::Mat> {
        let hdr_line = match skip {
            Some(skip) => skip as i64,
            None => -1, // no skipping
        };

        let (lines_of_words, _) = read_lines_of_words(tsv_file, hdr_line)?;

        if lines_of_words.is_empty() {
            return Err(anyhow::anyhow!("No data in file {}", tsv_file));
        }

        let nrows = lines_of_words.len();
        let ncols = lines_of_words[0].len();

        let mut data = Vec::with_capacity(nrows * ncols);
        for (i, words) in lines_of_words.iter().enumerate() {
            if words.len() != ncols {
                return Err(anyhow::anyhow!(
                    "line {} of {} has {} columns, expected {}",
                    i + 1,
                    tsv_file,
                    words.len(),
                    ncols
                ));
            }
            for w in words {
                data.push(parse_value(w)?);
            }
        }

        Ok(Array2::from_shape_vec((nrows, ncols), data)?)
    }

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()> {
        let lines: Vec<Box<str>> = self
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join("\t")
                    .into_boxed_str()
            })
            .collect();
        write_lines(&lines, tsv_file)?;
        Ok(())
    }
}
