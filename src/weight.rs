pub const K1: f32 = 1.2;
pub const B: f32 = 0.75;

#[derive(Clone, Copy, Debug)]
pub struct Bm25Weight {
    weight: f32, // idf * (1 + K1) * query_count
    avgdl: f32,
}

impl Bm25Weight {
    pub fn new(count: u32, idf: f32, avgdl: f32) -> Self {
        let weight = count as f32 * idf * (1.0 + K1);
        Self { weight, avgdl }
    }

    #[inline]
    pub fn score(&self, len: u32, tf: u32) -> f32 {
        let len = len as f32;
        let tf = tf as f32;
        self.weight * tf / (tf + K1 * (1.0 - B + B * len / self.avgdl))
    }
}

// ln { (N + 1) / (n(q) + 0.5) }
#[inline]
pub fn idf(doc_cnt: u64, doc_freq: u64) -> f32 {
    // tombstoned postings can outnumber live documents until they are purged
    let doc_freq = doc_freq.min(doc_cnt);
    (((doc_cnt + 1) as f32) / (doc_freq as f32 + 0.5)).ln()
}

pub fn avgdl(doc_cnt: u64, doc_term_cnt: u64) -> f32 {
    if doc_cnt == 0 {
        return 1.0;
    }
    (doc_term_cnt as f32 / doc_cnt as f32).max(f32::MIN_POSITIVE)
}
