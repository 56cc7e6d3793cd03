//! Training job configuration in the layout the orchestrator expects.

use serde::{Deserialize, Serialize};

pub const QWEN_IMAGE_EDIT_MODEL: &str = "Qwen/Qwen-Image-Edit-2509";
pub const QWEN_IMAGE_EDIT_ACCURACY_ADAPTER: &str =
    "uint3|ostris/accuracy_recovery_adapters/qwen_image_edit_2509_torchao_uint3.safetensors";
pub const DEFAULT_GPU_IDS: &[u32] = &[0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: String,
    pub config: ProcessConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub process: Vec<TrainerProcess>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerProcess {
    #[serde(rename = "type")]
    pub kind: String,
    pub training_folder: String,
    pub device: String,
    pub network: NetworkConfig,
    pub save: SaveConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub sample: SampleConfig,
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub linear: u32,
    pub linear_alpha: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfig {
    pub dtype: String,
    pub save_every: u32,
    pub max_step_saves_to_keep: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name_or_path: String,
    pub arch: String,
    pub quantize: bool,
    pub quantize_te: bool,
    pub low_vram: bool,
    pub qtype: String,
    pub qtype_te: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: u32,
    pub cache_text_embeddings: bool,
    pub steps: u32,
    pub gradient_accumulation: u32,
    pub timestep_type: String,
    pub train_unet: bool,
    pub train_text_encoder: bool,
    pub gradient_checkpointing: bool,
    pub noise_scheduler: String,
    pub optimizer: String,
    pub lr: f64,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    pub sampler: String,
    pub sample_every: u32,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub walk_seed: bool,
    pub guidance_scale: f64,
    pub sample_steps: u32,
    pub samples: Vec<SamplePrompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePrompt {
    pub prompt: String,
    pub neg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub folder_path: String,
    pub caption_ext: String,
    pub caption_dropout_rate: f64,
    pub resolution: Vec<u32>,
}

impl JobConfig {
    /// LoRA fine-tune of Qwen Image Edit 2509 over the dataset staged at `dataset_path`.
    pub fn qwen_image_edit_2509(dataset_path: &str, job_name: &str) -> Self {
        Self {
            job: "extension".to_string(),
            config: ProcessConfig {
                name: job_name.to_string(),
                process: vec![TrainerProcess {
                    kind: "diffusion_trainer".to_string(),
                    training_folder: "output".to_string(),
                    device: "cuda:0".to_string(),
                    network: NetworkConfig {
                        kind: "lora".to_string(),
                        linear: 16,
                        linear_alpha: 16,
                    },
                    save: SaveConfig {
                        dtype: "float16".to_string(),
                        save_every: 250,
                        max_step_saves_to_keep: 4,
                    },
                    model: ModelConfig {
                        name_or_path: QWEN_IMAGE_EDIT_MODEL.to_string(),
                        arch: "qwen_image_edit_plus".to_string(),
                        quantize: true,
                        quantize_te: true,
                        low_vram: true,
                        qtype: QWEN_IMAGE_EDIT_ACCURACY_ADAPTER.to_string(),
                        qtype_te: "qfloat8".to_string(),
                    },
                    train: TrainConfig {
                        batch_size: 1,
                        cache_text_embeddings: true,
                        steps: 500,
                        gradient_accumulation: 1,
                        timestep_type: "weighted".to_string(),
                        train_unet: true,
                        train_text_encoder: false,
                        gradient_checkpointing: true,
                        noise_scheduler: "flowmatch".to_string(),
                        optimizer: "adamw8bit".to_string(),
                        lr: 0.0001,
                        dtype: "bf16".to_string(),
                    },
                    sample: SampleConfig {
                        sampler: "flowmatch".to_string(),
                        sample_every: 250,
                        width: 1024,
                        height: 1024,
                        seed: 42,
                        walk_seed: true,
                        guidance_scale: 3.0,
                        sample_steps: 25,
                        samples: vec![SamplePrompt {
                            prompt: "a professional photo".to_string(),
                            neg: String::new(),
                        }],
                    },
                    datasets: vec![DatasetConfig {
                        folder_path: dataset_path.to_string(),
                        caption_ext: "txt".to_string(),
                        caption_dropout_rate: 0.05,
                        resolution: vec![512, 768, 1024],
                    }],
                }],
            },
        }
    }
}
