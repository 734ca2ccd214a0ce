//! The generate / edit / blend pipeline run by the job worker.

use crate::commands::DEFAULT_BLEND_STRENGTH;
use crate::error::JobError;
use crate::followup::{FollowUpRegistry, follow_ups_for};
use crate::progress::{ProgressReporter, ProgressState, prompt_preview};
use crate::queue::{JobKind, JobParams, JobProcessor, QueueItem};
use async_trait::async_trait;
use base64::Engine;
use bb_channels::{OutboundFile, OutboundMessage};
use bb_gen::{
    GenerationRequest, Provenance, RequestOptions, ResilientDispatcher, blend_request,
    edit_request, extract_artifacts, generate_request,
};
use bb_media::{
    ArtifactMaterializer, ImageSource, MaterializedImage, SourceResolver, TempResources,
    prepare_for_api,
};
use chrono::Utc;
use std::sync::Arc;

pub struct ImageJobProcessor {
    model: String,
    dispatcher: ResilientDispatcher,
    resolver: SourceResolver,
    materializer: ArtifactMaterializer,
    followups: Arc<FollowUpRegistry>,
}

impl ImageJobProcessor {
    pub fn new(
        model: impl Into<String>,
        dispatcher: ResilientDispatcher,
        resolver: SourceResolver,
        materializer: ArtifactMaterializer,
        followups: Arc<FollowUpRegistry>,
    ) -> Self {
        Self {
            model: model.into(),
            dispatcher,
            resolver,
            materializer,
            followups,
        }
    }

    /// Resolves one source to a file and returns it as an API-ready data URL.
    async fn prepare_source(
        &self,
        source: &ImageSource,
        temp: &mut TempResources,
    ) -> Result<String, JobError> {
        let resolved = self.resolver.resolve(source, temp).await?;
        Ok(prepare_for_api(&resolved, self.resolver.limits(), temp).await?)
    }

    fn build_request(
        &self,
        kind: JobKind,
        params: &JobParams,
        images: Vec<String>,
        mask: Option<String>,
    ) -> Result<GenerationRequest, JobError> {
        let options = RequestOptions {
            seed: params.seed,
            format: Some(params.format.to_string()),
            size: params.size.clone(),
        };
        let request = match kind {
            JobKind::Generate => Ok(generate_request(
                &self.model,
                &params.prompt,
                params.style.as_deref(),
                options,
            )),
            JobKind::Edit => edit_request(&self.model, &params.prompt, images, mask, options),
            JobKind::Blend => blend_request(
                &self.model,
                &params.prompt,
                images,
                params.strength.unwrap_or(DEFAULT_BLEND_STRENGTH),
                options,
            ),
        };
        request.map_err(|e| JobError::Validation(e.to_string()))
    }

    /// The first output, kept inline so follow-ups outlive the job's files.
    async fn follow_up_artifact(images: &[MaterializedImage]) -> Option<ImageSource> {
        let first = images.first()?;
        match tokio::fs::read(&first.path).await {
            Ok(bytes) => Some(ImageSource::Inline {
                mime: first.content_type.to_string(),
                data_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            Err(e) => {
                tracing::warn!(%e, "could not keep output for follow-ups");
                None
            }
        }
    }
}

#[async_trait]
impl JobProcessor for ImageJobProcessor {
    #[tracing::instrument(level = "info", skip_all, fields(job_id = %item.id, kind = %item.kind))]
    async fn process(
        &self,
        item: &QueueItem,
        temp: &mut TempResources,
        progress: &mut ProgressReporter,
    ) -> Result<(), JobError> {
        let params = &item.params;
        progress.advance(ProgressState::Processing).await?;

        let mut images = Vec::with_capacity(params.sources.len());
        for source in &params.sources {
            images.push(self.prepare_source(source, temp).await?);
        }
        let mask = match &params.mask {
            Some(mask) => Some(self.prepare_source(mask, temp).await?),
            None => None,
        };
        let request = self.build_request(item.kind, params, images, mask)?;

        progress.advance(item.kind.working_state()).await?;
        let response = self.dispatcher.call(&request).await?;

        let provenance = Provenance {
            seed: params.seed,
            style: params.style.clone(),
            prompt: Some(params.prompt.clone()),
            model: Some(self.model.clone()),
        };
        let mut artifacts = extract_artifacts(&response, &provenance);
        if item.kind == JobKind::Generate {
            artifacts.truncate(usize::from(params.count));
        }
        if artifacts.is_empty() {
            return Err(JobError::Processing(
                "the image service returned no images".to_string(),
            ));
        }

        progress.advance(ProgressState::Finalizing).await?;
        let outputs = self
            .materializer
            .materialize_all(&artifacts, params.format, item.kind.file_prefix(), temp)
            .await;
        if outputs.is_empty() {
            return Err(JobError::Processing(
                "none of the returned images could be decoded".to_string(),
            ));
        }
        tracing::info!(
            returned = artifacts.len(),
            delivered = outputs.len(),
            "artifacts materialized"
        );

        let files = outputs
            .iter()
            .map(|image| OutboundFile {
                name: image.file_name.clone(),
                content_type: image.content_type.to_string(),
                path: image.path.clone(),
            })
            .collect();
        let message = OutboundMessage::text(format!("**Prompt:** {}", prompt_preview(&params.prompt)))
            .replying_to(item.context.reply_to.clone())
            .with_files(files);
        item.context
            .channel
            .send(&item.context.recipient, message)
            .await
            .map_err(|e| JobError::Processing(format!("could not deliver images: {e}")))?;

        let artifact = Self::follow_up_artifact(&outputs).await;
        let now = Utc::now();
        let actions = follow_ups_for(item.kind, params, artifact)
            .into_iter()
            .map(|spec| self.followups.register(spec, now))
            .collect();
        progress.complete(outputs.len(), actions).await?;
        Ok(())
    }
}
