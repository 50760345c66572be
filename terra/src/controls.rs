//! Camera movement for the headless fly-through. Movement is steered the way a player would steer
//! it, with a direction held down and the view turned, and smoothed by acceleration and decay.

use cgmath::{Angle, Basis3, Deg, InnerSpace, Point3, Rad, Rotation, Rotation3, Vector3, Zero};

use terra_world::CameraState;

use crate::settings::ExploreParams;

#[derive(Clone)]
pub struct ControlState {
    look_at_dir: Vector3<f64>,
    /// x is right, y is up, z is forward. Each component is -1, 0 or 1.
    camera_dir: Vector3<i32>,
    camera_pan: AccelControlState,
    prev_camera: Option<CameraState>,
}

#[derive(Debug, Clone)]
struct AccelControlParams {
    pub acceleration: f64,
    pub decay: f64,
    pub max_speed: Option<f64>,
}

#[derive(Clone)]
struct AccelControlState {
    // parameters
    params: AccelControlParams,

    // state
    direction: Option<Vector3<f64>>,
    current_vel: Vector3<f64>,
    current_value: Point3<f64>,
}

impl ControlState {
    pub fn new(params: &ExploreParams) -> Self {
        ControlState {
            look_at_dir: params.look_at_dir.normalize(),
            camera_dir: Vector3::zero(),
            camera_pan: AccelControlState::new(
                params.initial_camera_pos,
                AccelControlParams {
                    acceleration: 8.0,
                    decay: 5.0,
                    max_speed: Some(2.0),
                },
            ),
            prev_camera: None,
        }
    }

    pub fn look_at_dir(&self) -> Vector3<f64> {
        self.look_at_dir
    }

    pub fn position(&self) -> Point3<f64> {
        self.camera_pan.value()
    }

    /// Holds the camera moving in a direction relative to where it is looking, until the next
    /// call. A zero direction stops the camera.
    pub fn steer(&mut self, direction: Vector3<i32>) {
        let clamp = |value: i32| value.max(-1).min(1);
        self.camera_dir = Vector3::new(clamp(direction.x), clamp(direction.y), clamp(direction.z));

        if self.camera_dir == Vector3::zero() {
            self.camera_pan.set_direction(None);
        } else {
            self.camera_pan
                .set_direction(Some(Self::pan_direction(self.look_at_dir, self.camera_dir)));
        }
    }

    /// Turns the view. Pitch is limited so the camera never looks closer than 15 degrees to
    /// straight up or down.
    pub fn turn(&mut self, yaw: Rad<f64>, pitch: Rad<f64>) {
        let up = Vector3::new(0., 1., 0.);
        let right = {
            let mut right = self.look_at_dir.cross(up);
            right.y = 0.;
            if right.magnitude2() > 0. {
                right.normalize()
            } else {
                // looking straight up or down
                Vector3::new(1., 0., 0.)
            }
        };

        let pitch = {
            let max_angle_from_vertical: Rad<f64> = Deg(15.).into();

            let angle_from_up = Rad::acos(self.look_at_dir.dot(up));
            let angle_from_down = Rad::acos(self.look_at_dir.dot(-up));

            let max_pitch: Rad<f64> = (angle_from_up - max_angle_from_vertical).normalize_signed();
            let min_pitch: Rad<f64> =
                -(angle_from_down - max_angle_from_vertical).normalize_signed();

            if pitch < min_pitch {
                min_pitch
            } else if pitch > max_pitch {
                max_pitch
            } else {
                pitch
            }
        };

        let rotation: Basis3<f64> =
            Basis3::from_axis_angle(up, yaw) * Basis3::from_axis_angle(right, pitch);

        self.look_at_dir = rotation.rotate_vector(self.look_at_dir).normalize();

        // keep moving the same way relative to the new view
        let camera_dir = self.camera_dir;
        self.steer(camera_dir);
    }

    pub fn tick(&mut self, elapsed: f64) -> CameraState {
        self.camera_pan.tick(elapsed);

        let position = self.camera_pan.value();
        let modified = match &self.prev_camera {
            None => true,
            Some(prev) => prev.position != position || prev.look_at_dir != self.look_at_dir,
        };

        let camera = CameraState {
            position,
            look_at_dir: self.look_at_dir,
            modified,
        };
        self.prev_camera = Some(camera);
        camera
    }

    fn pan_direction(look_at_dir: Vector3<f64>, direction: Vector3<i32>) -> Vector3<f64> {
        let up = Vector3::new(0., 1., 0.);

        let mut forward_step = look_at_dir;
        forward_step.y = 0.0;
        if forward_step.magnitude2() > 0. {
            forward_step = forward_step.normalize();
        }

        let mut right_step = look_at_dir.cross(up);
        right_step.y = 0.0;
        if right_step.magnitude2() > 0. {
            right_step = right_step.normalize();
        }

        let mut dir = Vector3::zero();
        dir += forward_step * direction.z as f64;
        dir += right_step * direction.x as f64;
        dir += up * direction.y as f64;
        dir
    }
}

impl AccelControlState {
    fn new(initial_value: Point3<f64>, params: AccelControlParams) -> Self {
        Self {
            params,

            direction: None,
            current_vel: Vector3::zero(),
            current_value: initial_value,
        }
    }

    fn tick(&mut self, interval: f64) {
        let direction = match self.direction {
            Some(x) => x,
            None => Vector3::zero(),
        };

        self.current_vel += self.params.acceleration * interval * direction;

        if let Some(max_speed) = self.params.max_speed {
            if self.current_vel.magnitude() > max_speed {
                self.current_vel = self.current_vel.normalize_to(max_speed)
            }
        }

        self.current_value += self.current_vel;
        self.current_vel -= self.current_vel * self.params.decay * interval;
    }

    fn value(&self) -> Point3<f64> {
        self.current_value
    }

    fn set_direction(&mut self, direction: Option<Vector3<f64>>) {
        if direction == self.direction {
            return;
        }

        if direction.is_none() {
            self.current_vel = Vector3::zero();
        }

        self.direction = direction.map(|d| {
            if d.magnitude() > 0.01 {
                d.normalize()
            } else {
                Vector3::zero()
            }
        });
    }
}
