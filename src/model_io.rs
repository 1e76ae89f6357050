//! Model persistence: a versioned binary format and a human-readable text
//! dump carrying the same logical content.

use std::io::{BufRead, Read, Write};
use std::str::FromStr;

use bincode::config::{standard, Configuration};

use crate::classifier::CrfClassifier;
use crate::config::{AnnealingKind, CrfConfig, InferenceKind, OptimizerKind, PriorKind};
use crate::datum::FeatureFactory;
use crate::errors::{Result, SeqCrfError};
use crate::index::Index;
use crate::label::LabelTuple;
use crate::objective::Regularizer;

const MAGIC: [u8; 6] = *b"seqcrf";
const VERSION: u32 = 1;

fn bincode_config() -> Configuration {
    standard()
}

fn encode_record<T: bincode::Encode, W: Write>(value: &T, writer: &mut W) -> Result<()> {
    bincode::encode_into_std_write(value, writer, bincode_config()).map_err(|e| match e {
        bincode::error::EncodeError::Io { inner, .. } => SeqCrfError::Resource(inner),
        other => SeqCrfError::format(format!("cannot encode model record: {other}")),
    })?;
    Ok(())
}

fn decode_record<T: bincode::Decode<()>, R: Read>(reader: &mut R, what: &str) -> Result<T> {
    bincode::decode_from_std_read(reader, bincode_config()).map_err(|e| match e {
        bincode::error::DecodeError::Io { inner, .. } => SeqCrfError::Resource(inner),
        other => SeqCrfError::format(format!("bad {what} record: {other}")),
    })
}

impl<F: FeatureFactory> CrfClassifier<F> {
    /// Writes the model in the binary format: magic, version, label tuple
    /// indices, class index, feature index, configuration, feature factory
    /// identifier, window, feature order map, ragged weights, and the
    /// known-lowercase-word set.
    ///
    /// # Errors
    ///
    /// Surfaces I/O failures as `Resource` errors.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        encode_record(&MAGIC, writer)?;
        encode_record(&VERSION, writer)?;
        encode_record(&self.label_indices, writer)?;
        encode_record(&self.classes, writer)?;
        encode_record(&self.features, writer)?;
        encode_record(&self.config, writer)?;
        encode_record(&self.factory.identifier().to_string(), writer)?;
        encode_record(&(self.config.window as u64), writer)?;
        let orders: Vec<u32> = self
            .feature_orders
            .iter()
            .map(|&o| u32::try_from(o).expect("orders fit in u32"))
            .collect();
        encode_record(&orders, writer)?;
        encode_record(&self.weights, writer)?;
        encode_record(&self.known_lc_words, writer)?;
        writer.flush()?;
        log::info!("serialized a model with {} weights rows", self.weights.len());
        Ok(())
    }

    /// Reads a model written by [`serialize`], checking the magic prefix,
    /// the version, and every declared length against the records that
    /// follow.
    ///
    /// [`serialize`]: CrfClassifier::serialize
    ///
    /// # Errors
    ///
    /// Returns a `Format` error on any mismatch, a `Config` error when the
    /// supplied factory does not match the persisted identifier, and
    /// `Resource` errors for I/O failures.
    pub fn deserialize<R: Read>(reader: &mut R, factory: F) -> Result<Self> {
        let magic: [u8; 6] = decode_record(reader, "magic")?;
        if magic != MAGIC {
            return Err(SeqCrfError::format("not a seqcrf model file"));
        }
        let version: u32 = decode_record(reader, "version")?;
        if version != VERSION {
            return Err(SeqCrfError::format(format!(
                "unsupported model version {version}"
            )));
        }
        let label_indices: Vec<Index<LabelTuple>> = decode_record(reader, "label indices")?;
        let classes: Index<String> = decode_record(reader, "class index")?;
        let features: Index<String> = decode_record(reader, "feature index")?;
        let config: CrfConfig = decode_record(reader, "configuration")?;
        let factory_id: String = decode_record(reader, "feature factory identifier")?;
        let window: u64 = decode_record(reader, "window")?;
        let orders: Vec<u32> = decode_record(reader, "feature order map")?;
        let weights: Vec<Vec<f64>> = decode_record(reader, "weights")?;
        let known_lc_words: Vec<String> = decode_record(reader, "known lowercase words")?;

        let feature_orders: Vec<usize> = orders.into_iter().map(|o| o as usize).collect();
        let classifier = Self {
            config,
            factory,
            classes,
            features,
            label_indices,
            feature_orders,
            weights,
            known_lc_words,
        };
        classifier.check_consistency(window as usize)?;
        if classifier.factory.identifier() != factory_id {
            return Err(SeqCrfError::config(format!(
                "model was built with feature factory {factory_id:?}, got {:?}",
                classifier.factory.identifier()
            )));
        }
        Ok(classifier)
    }

    fn check_consistency(&self, window: usize) -> Result<()> {
        if window != self.config.window {
            return Err(SeqCrfError::format(
                "window record disagrees with the configuration",
            ));
        }
        if self.label_indices.len() != window {
            return Err(SeqCrfError::format(format!(
                "expected {window} label tuple indices, found {}",
                self.label_indices.len()
            )));
        }
        for (order, index) in self.label_indices.iter().enumerate() {
            for tuple in index.iter() {
                if tuple.len() != order + 1 {
                    return Err(SeqCrfError::format(format!(
                        "label tuple of length {} in the order-{order} index",
                        tuple.len()
                    )));
                }
            }
        }
        if self.classes.index_of(&self.config.background_symbol).is_none() {
            return Err(SeqCrfError::format(
                "background symbol missing from the class index",
            ));
        }
        if self.feature_orders.len() != self.features.len() {
            return Err(SeqCrfError::format(format!(
                "feature order map covers {} of {} features",
                self.feature_orders.len(),
                self.features.len()
            )));
        }
        if self.weights.len() != self.features.len() {
            return Err(SeqCrfError::format(format!(
                "weight table covers {} of {} features",
                self.weights.len(),
                self.features.len()
            )));
        }
        for (f, &order) in self.feature_orders.iter().enumerate() {
            if order >= self.label_indices.len() {
                return Err(SeqCrfError::format(format!(
                    "feature {f} has order {order} beyond the window"
                )));
            }
            if self.weights[f].len() != self.label_indices[order].len() {
                return Err(SeqCrfError::format(format!(
                    "weight row {f} has {} entries, expected {}",
                    self.weights[f].len(),
                    self.label_indices[order].len()
                )));
            }
        }
        Ok(())
    }

    /// Writes the model as tab-separated text sections with explicit
    /// counts. The dump carries the same logical content as the binary
    /// format, and re-serializing a loaded dump is byte-identical.
    ///
    /// # Errors
    ///
    /// Surfaces I/O failures as `Resource` errors.
    pub fn serialize_text<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(writer, "label-indices\t{}", self.label_indices.len())?;
        for (order, index) in self.label_indices.iter().enumerate() {
            writeln!(writer, "label-index\t{order}\t{}", index.len())?;
            for (id, tuple) in index.iter().enumerate() {
                let labels: Vec<String> =
                    tuple.labels().iter().map(ToString::to_string).collect();
                writeln!(writer, "{id}\t{}", labels.join(" "))?;
            }
        }

        writeln!(writer, "classes\t{}", self.classes.len())?;
        for (id, class) in self.classes.iter().enumerate() {
            writeln!(writer, "{id}\t{class}")?;
        }

        writeln!(writer, "features\t{}", self.features.len())?;
        for (id, feature) in self.features.iter().enumerate() {
            writeln!(writer, "{id}\t{feature}")?;
        }

        writeln!(writer, "<flags>")?;
        write_flags(writer, &self.config)?;
        writeln!(writer, "</flags>")?;

        writeln!(writer, "<feature-factory> {} </feature-factory>", self.factory.identifier())?;
        writeln!(writer, "<window> {} </window>", self.config.window)?;

        writeln!(writer, "feature-orders\t{}", self.feature_orders.len())?;
        for (id, order) in self.feature_orders.iter().enumerate() {
            writeln!(writer, "{id}\t{order}")?;
        }

        writeln!(writer, "weights\t{}", self.weights.len())?;
        for row in &self.weights {
            let values: Vec<String> = row.iter().map(ToString::to_string).collect();
            writeln!(writer, "{}\t{}", row.len(), values.join(" "))?;
        }

        writeln!(writer, "known-lc-words\t{}", self.known_lc_words.len())?;
        for (id, word) in self.known_lc_words.iter().enumerate() {
            writeln!(writer, "{id}\t{word}")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a model written by [`serialize_text`].
    ///
    /// [`serialize_text`]: CrfClassifier::serialize_text
    ///
    /// # Errors
    ///
    /// Returns a `Format` error on any malformed section, a `Config` error
    /// for a factory mismatch, and `Resource` errors for I/O failures.
    pub fn deserialize_text<R: BufRead>(reader: &mut R, factory: F) -> Result<Self> {
        let mut lines = TextLines::new(reader);

        let count: usize = lines.counted_header("label-indices")?;
        let mut label_indices = Vec::with_capacity(count);
        for order in 0..count {
            let line = lines.next_line()?;
            let mut parts = line.split('\t');
            if parts.next() != Some("label-index") {
                return Err(SeqCrfError::format("expected a label-index header"));
            }
            let declared_order: usize = parse_field(parts.next(), "label index order")?;
            if declared_order != order {
                return Err(SeqCrfError::format("label indices out of order"));
            }
            let size: usize = parse_field(parts.next(), "label index size")?;
            let mut index = Index::new();
            for id in 0..size {
                let line = lines.next_line()?;
                let (declared, rest) = split_id(&line)?;
                if declared != id {
                    return Err(SeqCrfError::format("label tuple ids out of order"));
                }
                let labels = rest
                    .split(' ')
                    .map(|l| {
                        l.parse::<usize>().map_err(|_| {
                            SeqCrfError::format(format!("bad label id {l:?}"))
                        })
                    })
                    .collect::<Result<Vec<usize>>>()?;
                if labels.len() != order + 1 {
                    return Err(SeqCrfError::format(format!(
                        "label tuple of length {} in the order-{order} index",
                        labels.len()
                    )));
                }
                index.index_of_or_add(&LabelTuple::new(&labels));
            }
            if index.len() != size {
                return Err(SeqCrfError::format("duplicate label tuples"));
            }
            label_indices.push(index);
        }

        let classes = lines.indexed_strings("classes")?;
        let features = lines.indexed_strings("features")?;

        if lines.next_line()? != "<flags>" {
            return Err(SeqCrfError::format("expected <flags>"));
        }
        let mut config = CrfConfig::default();
        loop {
            let line = lines.next_line()?;
            if line == "</flags>" {
                break;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| SeqCrfError::format(format!("bad flag line {line:?}")))?;
            apply_flag(&mut config, key, value)?;
        }
        config.validate()?;

        let factory_line = lines.next_line()?;
        let factory_id = factory_line
            .strip_prefix("<feature-factory> ")
            .and_then(|s| s.strip_suffix(" </feature-factory>"))
            .ok_or_else(|| SeqCrfError::format("expected the feature factory section"))?
            .to_string();

        let window_line = lines.next_line()?;
        let window: usize = window_line
            .strip_prefix("<window> ")
            .and_then(|s| s.strip_suffix(" </window>"))
            .ok_or_else(|| SeqCrfError::format("expected the window section"))?
            .parse()
            .map_err(|_| SeqCrfError::format("bad window value"))?;

        let count: usize = lines.counted_header("feature-orders")?;
        let mut feature_orders = Vec::with_capacity(count);
        for id in 0..count {
            let line = lines.next_line()?;
            let (declared, rest) = split_id(&line)?;
            if declared != id {
                return Err(SeqCrfError::format("feature orders out of order"));
            }
            feature_orders.push(
                rest.parse::<usize>()
                    .map_err(|_| SeqCrfError::format(format!("bad order {rest:?}")))?,
            );
        }

        let count: usize = lines.counted_header("weights")?;
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines.next_line()?;
            let (width, rest) = split_id(&line)?;
            let row = if rest.is_empty() {
                Vec::new()
            } else {
                rest.split(' ')
                    .map(|v| {
                        v.parse::<f64>().map_err(|_| {
                            SeqCrfError::format(format!("bad weight {v:?}"))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?
            };
            if row.len() != width {
                return Err(SeqCrfError::format(format!(
                    "weight row declares {width} entries, found {}",
                    row.len()
                )));
            }
            weights.push(row);
        }

        let count: usize = lines.counted_header("known-lc-words")?;
        let mut known_lc_words = Vec::with_capacity(count);
        for id in 0..count {
            let line = lines.next_line()?;
            let (declared, word) = split_id(&line)?;
            if declared != id {
                return Err(SeqCrfError::format("known words out of order"));
            }
            known_lc_words.push(word.to_string());
        }

        let classifier = Self {
            config,
            factory,
            classes,
            features,
            label_indices,
            feature_orders,
            weights,
            known_lc_words,
        };
        classifier.check_consistency(window)?;
        if classifier.factory.identifier() != factory_id {
            return Err(SeqCrfError::config(format!(
                "model was built with feature factory {factory_id:?}, got {:?}",
                classifier.factory.identifier()
            )));
        }
        Ok(classifier)
    }
}

struct TextLines<'a, R: BufRead> {
    reader: &'a mut R,
    buffer: String,
}

impl<'a, R: BufRead> TextLines<'a, R> {
    fn new(reader: &'a mut R) -> Self {
        Self {
            reader,
            buffer: String::new(),
        }
    }

    fn next_line(&mut self) -> Result<String> {
        self.buffer.clear();
        let n = self.reader.read_line(&mut self.buffer)?;
        if n == 0 {
            return Err(SeqCrfError::format("unexpected end of model dump"));
        }
        Ok(self.buffer.trim_end_matches('\n').to_string())
    }

    fn counted_header(&mut self, name: &str) -> Result<usize> {
        let line = self.next_line()?;
        let (key, count) = line
            .split_once('\t')
            .ok_or_else(|| SeqCrfError::format(format!("expected the {name} header")))?;
        if key != name {
            return Err(SeqCrfError::format(format!(
                "expected the {name} header, found {key:?}"
            )));
        }
        count
            .parse()
            .map_err(|_| SeqCrfError::format(format!("bad {name} count {count:?}")))
    }

    fn indexed_strings(&mut self, name: &str) -> Result<Index<String>> {
        let count = self.counted_header(name)?;
        let mut index = Index::new();
        for id in 0..count {
            let line = self.next_line()?;
            let (declared, value) = split_id(&line)?;
            if declared != id {
                return Err(SeqCrfError::format(format!("{name} ids out of order")));
            }
            index.index_of_or_add(&value.to_string());
        }
        if index.len() != count {
            return Err(SeqCrfError::format(format!("duplicate {name} entries")));
        }
        Ok(index)
    }
}

fn split_id(line: &str) -> Result<(usize, &str)> {
    let (id, rest) = line
        .split_once('\t')
        .ok_or_else(|| SeqCrfError::format(format!("expected id\\tvalue, found {line:?}")))?;
    let id = id
        .parse()
        .map_err(|_| SeqCrfError::format(format!("bad id {id:?}")))?;
    Ok((id, rest))
}

fn parse_field<T: FromStr>(field: Option<&str>, what: &str) -> Result<T> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| SeqCrfError::format(format!("bad {what}")))
}

fn write_flags<W: Write>(writer: &mut W, config: &CrfConfig) -> Result<()> {
    writeln!(writer, "window={}", config.window)?;
    writeln!(writer, "backgroundSymbol={}", config.background_symbol)?;
    writeln!(writer, "useReverse={}", config.use_reverse)?;
    writeln!(
        writer,
        "useObservedSequencesOnly={}",
        config.use_observed_sequences_only
    )?;
    writeln!(
        writer,
        "removeBackgroundSingletonFeatures={}",
        config.remove_background_singleton_features
    )?;
    writeln!(writer, "inferenceType={}", config.inference)?;
    writeln!(writer, "beamSize={}", config.beam_size)?;
    writeln!(writer, "doGibbs={}", config.do_gibbs)?;
    writeln!(writer, "numSamples={}", config.num_samples)?;
    writeln!(writer, "annealingType={}", config.annealing)?;
    writeln!(writer, "annealingRate={}", config.annealing_rate)?;
    writeln!(writer, "initViterbi={}", config.init_viterbi)?;
    writeln!(writer, "entityPrior={}", config.prior)?;
    writeln!(writer, "optimizer={}", config.optimizer)?;
    writeln!(writer, "QNsize={}", config.qn_size)?;
    writeln!(writer, "useRobustQN={}", config.use_robust_qn)?;
    writeln!(writer, "SGDPasses={}", config.sgd_passes)?;
    writeln!(writer, "QNPasses={}", config.qn_passes)?;
    writeln!(writer, "initialGain={}", config.initial_gain)?;
    writeln!(
        writer,
        "stochasticBatchSize={}",
        config.stochastic_batch_size
    )?;
    writeln!(writer, "regularizer={}", config.regularizer)?;
    writeln!(writer, "sigma={}", config.sigma)?;
    if let Some(epsilon) = config.huber_epsilon {
        writeln!(writer, "epsilon={epsilon}")?;
    }
    writeln!(writer, "tolerance={}", config.tolerance)?;
    writeln!(writer, "featureDiffThresh={}", config.feature_diff_thresh)?;
    writeln!(
        writer,
        "numTimesPruneFeatures={}",
        config.num_times_prune_features
    )?;
    writeln!(
        writer,
        "saveFeatureIndexToDisk={}",
        config.save_feature_index_to_disk
    )?;
    if let Some(path) = &config.initial_weights {
        writeln!(writer, "initialWeights={path}")?;
    }
    writeln!(writer, "interimOutputFreq={}", config.interim_output_freq)?;
    if let Some(secs) = config.time_limit_secs {
        writeln!(writer, "timeLimitSecs={secs}")?;
    }
    writeln!(writer, "seed={}", config.seed)?;
    writeln!(writer, "numThreads={}", config.n_threads)?;
    Ok(())
}

fn apply_flag(config: &mut CrfConfig, key: &str, value: &str) -> Result<()> {
    fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
        value
            .parse()
            .map_err(|_| SeqCrfError::format(format!("bad value {value:?} for flag {key}")))
    }

    match key {
        "window" => config.window = parse(key, value)?,
        "backgroundSymbol" => config.background_symbol = value.to_string(),
        "useReverse" => config.use_reverse = parse(key, value)?,
        "useObservedSequencesOnly" => config.use_observed_sequences_only = parse(key, value)?,
        "removeBackgroundSingletonFeatures" => {
            config.remove_background_singleton_features = parse(key, value)?;
        }
        "inferenceType" => config.inference = value.parse::<InferenceKind>()?,
        "beamSize" => config.beam_size = parse(key, value)?,
        "doGibbs" => config.do_gibbs = parse(key, value)?,
        "numSamples" => config.num_samples = parse(key, value)?,
        "annealingType" => config.annealing = value.parse::<AnnealingKind>()?,
        "annealingRate" => config.annealing_rate = parse(key, value)?,
        "initViterbi" => config.init_viterbi = parse(key, value)?,
        "entityPrior" => config.prior = value.parse::<PriorKind>()?,
        "optimizer" => config.optimizer = value.parse::<OptimizerKind>()?,
        "QNsize" => config.qn_size = parse(key, value)?,
        "useRobustQN" => config.use_robust_qn = parse(key, value)?,
        "SGDPasses" => config.sgd_passes = parse(key, value)?,
        "QNPasses" => config.qn_passes = parse(key, value)?,
        "initialGain" => config.initial_gain = parse(key, value)?,
        "stochasticBatchSize" => config.stochastic_batch_size = parse(key, value)?,
        "regularizer" => config.regularizer = value.parse::<Regularizer>()?,
        "sigma" => config.sigma = parse(key, value)?,
        "epsilon" => config.huber_epsilon = Some(parse(key, value)?),
        "tolerance" => config.tolerance = parse(key, value)?,
        "featureDiffThresh" => config.feature_diff_thresh = parse(key, value)?,
        "numTimesPruneFeatures" => config.num_times_prune_features = parse(key, value)?,
        "saveFeatureIndexToDisk" => config.save_feature_index_to_disk = parse(key, value)?,
        "initialWeights" => config.initial_weights = Some(value.to_string()),
        "interimOutputFreq" => config.interim_output_freq = parse(key, value)?,
        "timeLimitSecs" => config.time_limit_secs = Some(parse(key, value)?),
        "seed" => config.seed = parse(key, value)?,
        "numThreads" => config.n_threads = parse(key, value)?,
        other => {
            return Err(SeqCrfError::format(format!("unknown flag {other:?}")));
        }
    }
    Ok(())
}
