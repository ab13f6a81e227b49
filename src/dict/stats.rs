//! Table statistics and their human-readable report.

use super::{Dict, DictType};
use core::fmt;
use core::hash::Hash;

/// Chain lengths at or beyond this share the last histogram slot.
pub const STATS_VECTLEN: usize = 50;

/// Shape of one bucket array.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    /// 0 for the main table, 1 for the rehashing target.
    pub table_index: usize,
    pub buckets: usize,
    pub used: usize,
    /// Chain-level fields below are only filled in a full report.
    pub full: bool,
    pub non_empty_buckets: usize,
    pub max_chain_len: usize,
    pub total_chain_len: usize,
    pub chain_len_histogram: Vec<usize>,
}

impl TableStats {
    /// Adds the counts of `other` into `self`.
    pub fn merge(&mut self, other: &TableStats) {
        self.buckets += other.buckets;
        self.used += other.used;
        self.full |= other.full;
        self.non_empty_buckets += other.non_empty_buckets;
        self.max_chain_len = self.max_chain_len.max(other.max_chain_len);
        self.total_chain_len += other.total_chain_len;
        if self.chain_len_histogram.len() < other.chain_len_histogram.len() {
            self.chain_len_histogram
                .resize(other.chain_len_histogram.len(), 0);
        }
        for (dst, src) in self
            .chain_len_histogram
            .iter_mut()
            .zip(&other.chain_len_histogram)
        {
            *dst += *src;
        }
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.table_index == 0 {
            "main hash table"
        } else {
            "rehashing target"
        };
        writeln!(f, "Hash table {} stats ({}):", self.table_index, label)?;
        writeln!(f, " table size: {}", self.buckets)?;
        writeln!(f, " number of elements: {}", self.used)?;
        if !self.full {
            return Ok(());
        }
        writeln!(f, " different slots: {}", self.non_empty_buckets)?;
        writeln!(f, " max chain length: {}", self.max_chain_len)?;
        let counted = if self.non_empty_buckets == 0 {
            0.0
        } else {
            self.total_chain_len as f64 / self.non_empty_buckets as f64
        };
        let computed = if self.non_empty_buckets == 0 {
            0.0
        } else {
            self.used as f64 / self.non_empty_buckets as f64
        };
        writeln!(f, " avg chain length (counted): {:.2}", counted)?;
        writeln!(f, " avg chain length (computed): {:.2}", computed)?;
        writeln!(f, " Chain length distribution:")?;
        for (len, &n) in self.chain_len_histogram.iter().enumerate() {
            if n == 0 {
                continue;
            }
            writeln!(
                f,
                "   {}: {} ({:.2}%)",
                len,
                n,
                n as f64 * 100.0 / self.buckets as f64
            )?;
        }
        Ok(())
    }
}

/// Statistics for both tables of a dict.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DictStats {
    pub main: TableStats,
    pub rehashing: Option<TableStats>,
}

impl DictStats {
    pub fn merge(&mut self, other: &DictStats) {
        self.main.merge(&other.main);
        match (&mut self.rehashing, &other.rehashing) {
            (Some(dst), Some(src)) => dst.merge(src),
            (dst @ None, Some(src)) => *dst = Some(src.clone()),
            _ => {}
        }
    }
}

impl fmt::Display for DictStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.main.used == 0 && self.rehashing.as_ref().map_or(true, |r| r.used == 0) {
            return writeln!(f, "No stats available for empty dictionaries");
        }
        write!(f, "{}", self.main)?;
        if let Some(r) = &self.rehashing {
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl<K, V, T> Dict<K, V, T>
where
    K: Eq + Hash,
    T: DictType,
{
    /// Shape of the tables. `full` walks every chain.
    pub fn stats(&self, full: bool) -> DictStats {
        DictStats {
            main: self.table_stats(0, full),
            rehashing: self.is_rehashing().then(|| self.table_stats(1, full)),
        }
    }

    fn table_stats(&self, t: usize, full: bool) -> TableStats {
        let table = &self.ht[t];
        let mut s = TableStats {
            table_index: t,
            buckets: table.size(),
            used: table.used,
            full,
            ..TableStats::default()
        };
        if !full || table.used == 0 {
            return s;
        }
        s.chain_len_histogram = vec![0; STATS_VECTLEN];
        for head in &table.buckets {
            let mut len = 0;
            let mut cur = *head;
            while let Some(k) = cur {
                len += 1;
                cur = self.entries[k].next;
            }
            s.chain_len_histogram[len.min(STATS_VECTLEN - 1)] += 1;
            if len > 0 {
                s.non_empty_buckets += 1;
                s.total_chain_len += len;
                s.max_chain_len = s.max_chain_len.max(len);
            }
        }
        s
    }
}
