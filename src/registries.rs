use std::collections::BTreeMap;

use anyhow::{bail, Result};
use tracing::warn;

use crate::config::{SinkSpec, SourceSpec};
use crate::convert::{BytesHandler, EvtxBytesHandler, PdfBytesHandler};
use crate::interfaces::{
    QualityScorer, QualityScorerFactory, Sink, SinkFactory, SinkFactoryContext, Source,
    SourceFactory, SourceFactoryContext,
};
use crate::records::JsonMap;

/// Registry of source factories keyed by spec kind.
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<&'static str, Box<dyn SourceFactory>>,
}

impl SourceRegistry {
    pub fn register(&mut self, factory: Box<dyn SourceFactory>) {
        self.factories.insert(factory.id(), factory);
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build_all(
        &self,
        ctx: &SourceFactoryContext<'_>,
        specs: &[SourceSpec],
    ) -> Result<Vec<Box<dyn Source>>> {
        let mut out = Vec::new();
        for spec in specs {
            let Some(factory) = self.factories.get(spec.kind.as_str()) else {
                bail!("unknown source kind {:?}", spec.kind);
            };
            out.extend(factory.build(ctx, spec)?);
        }
        Ok(out)
    }
}

/// Registry of sink factories; building threads an evolving context so
/// later factories observe sink-config updates from earlier ones.
#[derive(Default)]
pub struct SinkRegistry {
    factories: BTreeMap<&'static str, Box<dyn SinkFactory>>,
}

impl SinkRegistry {
    pub fn register(&mut self, factory: Box<dyn SinkFactory>) {
        self.factories.insert(factory.id(), factory);
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn build_all(
        &self,
        ctx: SinkFactoryContext,
        specs: &[SinkSpec],
    ) -> Result<(Vec<Box<dyn Sink>>, JsonMap, SinkFactoryContext)> {
        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        let mut merged_meta = JsonMap::new();
        let mut current = ctx;
        for spec in specs {
            let Some(factory) = self.factories.get(spec.kind.as_str()) else {
                bail!("unknown sink kind {:?}", spec.kind);
            };
            let result = factory.build(&current, spec)?;
            sinks.extend(result.sinks);
            for (k, v) in result.metadata {
                let absent = merged_meta.get(&k).map(|old| old.is_null()).unwrap_or(true);
                if absent {
                    merged_meta.insert(k, v);
                }
            }
            current = SinkFactoryContext {
                repo_context: result
                    .sink_config
                    .context
                    .clone()
                    .or(current.repo_context),
                sink_config: result.sink_config,
            };
        }
        Ok((sinks, merged_meta, current))
    }
}

/// Ordered registry of bytes handlers; dispatch order is registration order.
#[derive(Default)]
pub struct BytesHandlerRegistry {
    handlers: Vec<Box<dyn BytesHandler>>,
}

impl BytesHandlerRegistry {
    pub fn register(&mut self, handler: Box<dyn BytesHandler>) {
        self.handlers.push(handler);
    }

    pub fn into_handlers(self) -> Vec<Box<dyn BytesHandler>> {
        self.handlers
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Registry of quality-scorer factories; `get(None)` falls back to the
/// first registered factory.
#[derive(Default)]
pub struct QualityScorerRegistry {
    factories: BTreeMap<&'static str, Box<dyn QualityScorerFactory>>,
    order: Vec<&'static str>,
}

impl QualityScorerRegistry {
    pub fn register(&mut self, factory: Box<dyn QualityScorerFactory>) {
        let id = factory.id();
        if self.factories.insert(id, factory).is_none() {
            self.order.push(id);
        }
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.order.clone()
    }

    fn get(&self, factory_id: Option<&str>) -> Option<&dyn QualityScorerFactory> {
        match factory_id {
            Some(id) => self.factories.get(id).map(|f| f.as_ref()),
            None => self
                .order
                .first()
                .and_then(|id| self.factories.get(id))
                .map(|f| f.as_ref()),
        }
    }

    pub fn build(
        &self,
        options: &JsonMap,
        factory_id: Option<&str>,
    ) -> Option<Box<dyn QualityScorer>> {
        let factory = self.get(factory_id)?;
        match factory.build(options) {
            Ok(scorer) => Some(scorer),
            Err(e) => {
                warn!("quality scorer factory {} failed: {}", factory.id(), e);
                None
            }
        }
    }
}

/// All four registries bundled for the plan builder.
pub struct RegistryBundle {
    pub sources: SourceRegistry,
    pub sinks: SinkRegistry,
    pub bytes: BytesHandlerRegistry,
    pub scorers: QualityScorerRegistry,
}

pub fn default_source_registry() -> SourceRegistry {
    use crate::factories::{
        CsvTextSourceFactory, JsonlTextSourceFactory, LocalDirSourceFactory,
        SqliteSourceFactory, WebPagePdfSourceFactory, WebPdfListSourceFactory,
        ZipArchiveSourceFactory,
    };
    let mut reg = SourceRegistry::default();
    reg.register(Box::new(LocalDirSourceFactory));
    reg.register(Box::new(ZipArchiveSourceFactory));
    reg.register(Box::new(WebPdfListSourceFactory));
    reg.register(Box::new(WebPagePdfSourceFactory));
    reg.register(Box::new(CsvTextSourceFactory));
    reg.register(Box::new(JsonlTextSourceFactory));
    reg.register(Box::new(SqliteSourceFactory));
    reg
}

pub fn default_sink_registry() -> SinkRegistry {
    use crate::factories::{DefaultJsonlPromptSinkFactory, ParquetDatasetSinkFactory};
    let mut reg = SinkRegistry::default();
    reg.register(Box::new(DefaultJsonlPromptSinkFactory));
    reg.register(Box::new(ParquetDatasetSinkFactory));
    reg
}

pub fn default_bytes_registry() -> BytesHandlerRegistry {
    let mut reg = BytesHandlerRegistry::default();
    reg.register(Box::new(PdfBytesHandler));
    reg.register(Box::new(EvtxBytesHandler));
    reg
}

pub fn default_scorer_registry() -> QualityScorerRegistry {
    let mut reg = QualityScorerRegistry::default();
    reg.register(Box::new(crate::scorer::HeuristicScorerFactory));
    reg
}

pub fn default_registries() -> RegistryBundle {
    RegistryBundle {
        sources: default_source_registry(),
        sinks: default_sink_registry(),
        bytes: default_bytes_registry(),
        scorers: default_scorer_registry(),
    }
}
